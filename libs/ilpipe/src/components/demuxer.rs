// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Demuxer: pulls elementary-stream packets from a [`MediaParser`] and routes
//! them to the audio and video output ports.
//!
//! Each track has its own packet pool, so a stalled consumer on one track only
//! back-pressures that track. The "fully flushed" [`Event::BufferFlag`] is
//! raised once per session, after the parser hit end of stream and both
//! tracks' `ready` lists drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::core::{
    AudioPortFormat, BufferCounts, BufferFlags, BufferHeader, BufferId, ComponentBase,
    ComponentContext, ComponentHandle, ComponentHost, ComponentLogic, ComponentState, Config,
    ErrorCode, Event, ListKind, MediaInfo, MediaParser, NodeLists, Parameter, ParseStatus,
    ParserFactory, PipelineError, Port, PortDomain, Result, SeekMode, SkipTrack, Step, StreamKind,
    VideoPortFormat,
};

/// Demuxer component.
pub struct Demuxer;

impl Demuxer {
    pub const AUDIO_PORT: u32 = 0;
    pub const VIDEO_PORT: u32 = 1;
    /// Clock input. Tunneled for symmetry with the renderers; the demuxer
    /// does not pace itself on it.
    pub const CLOCK_PORT: u32 = 2;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let base = ComponentBase::new(
            context,
            vec![
                Port::output(Self::AUDIO_PORT, PortDomain::Audio),
                Port::output(Self::VIDEO_PORT, PortDomain::Video),
                Port::input(Self::CLOCK_PORT, PortDomain::Other),
            ],
        );
        ComponentHost::spawn_handle(base, DemuxerLogic::new(context))
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::DEMUXER, Demuxer::create)
}

/// One packet slot of a track's pool.
struct PacketNode {
    id: BufferId,
    data: Vec<u8>,
    pts: i64,
    flags: BufferFlags,
}

impl PacketNode {
    fn new(capacity: usize) -> Self {
        Self {
            id: BufferId::next(),
            data: Vec::with_capacity(capacity),
            pts: 0,
            flags: BufferFlags::empty(),
        }
    }

    fn header(&self) -> BufferHeader {
        BufferHeader::packet(
            self.id,
            Bytes::copy_from_slice(&self.data),
            self.pts,
            self.flags,
        )
    }
}

struct Track {
    port: u32,
    skip_bit: SkipTrack,
    lists: NodeLists<PacketNode>,
    /// An end-of-stream packet has been queued on this track.
    eos_queued: AtomicBool,
}

impl Track {
    fn new(port: u32, skip_bit: SkipTrack, nodes: usize, capacity: usize) -> Self {
        Self {
            port,
            skip_bit,
            lists: NodeLists::new(nodes, nodes, || PacketNode::new(capacity)),
            eos_queued: AtomicBool::new(false),
        }
    }

    /// Fill the head of `empty` and move it to `ready`. `false` when the pool
    /// is exhausted.
    fn queue(&self, data: &[u8], pts: i64, flags: BufferFlags) -> bool {
        let mut lists = self.lists.lock();
        let Some(id) = lists.front(ListKind::Empty) else {
            return false;
        };
        let node = lists.node_mut(id);
        node.data.clear();
        node.data.extend_from_slice(data);
        node.pts = pts;
        node.flags = flags;
        lists.move_node(id, ListKind::Empty, ListKind::Ready);
        if flags.contains(BufferFlags::EOS) {
            self.eos_queued.store(true, Ordering::Release);
        }
        true
    }
}

#[derive(Default)]
struct DemuxState {
    uri: Option<String>,
    parser: Option<Box<dyn MediaParser>>,
    media: MediaInfo,
    skip: SkipTrack,
    seek_mode: SeekMode,
    /// Parser reported end of stream. Sticky until a seek.
    eos: bool,
    eos_notified: bool,
    discard: Vec<u8>,
}

#[derive(Default)]
struct DemuxCounters {
    read: AtomicU64,
    discarded: AtomicU64,
    sent: AtomicU64,
    send_failed: AtomicU64,
    returned: AtomicU64,
}

enum Pull {
    Queued,
    Discarded,
    /// The destination pool has no empty node.
    Blocked,
    Eos,
}

enum Drain {
    Idle,
    Sent,
    Failed,
}

struct DemuxerLogic {
    state: Mutex<DemuxState>,
    audio: Track,
    video: Track,
    waiting_for_node: AtomicBool,
    retry_interval: Duration,
    counters: DemuxCounters,
    parsers: Arc<dyn ParserFactory>,
}

impl DemuxerLogic {
    fn new(context: &ComponentContext) -> Self {
        let config = &context.config.demuxer;
        Self {
            state: Mutex::new(DemuxState::default()),
            audio: Track::new(
                Demuxer::AUDIO_PORT,
                SkipTrack::AUDIO,
                config.audio_packet_nodes,
                config.initial_packet_capacity,
            ),
            video: Track::new(
                Demuxer::VIDEO_PORT,
                SkipTrack::VIDEO,
                config.video_packet_nodes,
                config.initial_packet_capacity,
            ),
            waiting_for_node: AtomicBool::new(false),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            counters: DemuxCounters::default(),
            parsers: Arc::clone(&context.backends.parsers),
        }
    }

    fn track(&self, port: u32) -> Result<&Track> {
        match port {
            Demuxer::AUDIO_PORT => Ok(&self.audio),
            Demuxer::VIDEO_PORT => Ok(&self.video),
            other => Err(PipelineError::BadPortIndex(other)),
        }
    }

    fn tracks(&self) -> [&Track; 2] {
        [&self.audio, &self.video]
    }

    /// Tracks that will carry packets this session.
    fn live_tracks(&self, state: &DemuxState) -> Vec<&Track> {
        let mut live = Vec::with_capacity(2);
        if state.media.audio.is_some() && !state.skip.contains(SkipTrack::AUDIO) {
            live.push(&self.audio);
        }
        if state.media.video.is_some() && !state.skip.contains(SkipTrack::VIDEO) {
            live.push(&self.video);
        }
        live
    }

    fn open(&self, base: &ComponentBase, uri: &str) -> Result<()> {
        let state_now = base.state();
        if state_now != ComponentState::Loaded {
            return Err(PipelineError::IncorrectStateOperation(state_now));
        }

        let mut parser = self.parsers.open(uri).map_err(|e| {
            base.notify_error(ErrorCode::FormatNotDetected, 0);
            PipelineError::FormatNotDetected(format!("cannot open {}: {}", uri, e))
        })?;
        let mut media = parser.media_info()?;

        if let Some(coding) = media.video.as_ref().map(|v| v.coding).filter(|c| !c.is_video()) {
            tracing::warn!(
                "[{}] Video coding {:?} is not supported, ignoring the track",
                base.name(),
                coding
            );
            base.notify_error(ErrorCode::FormatNotDetected, Demuxer::VIDEO_PORT);
            media.video = None;
        }
        if let Some(coding) = media.audio.as_ref().map(|a| a.coding).filter(|c| !c.is_audio()) {
            tracing::warn!(
                "[{}] Audio coding {:?} is not supported, ignoring the track",
                base.name(),
                coding
            );
            base.notify_error(ErrorCode::FormatNotDetected, Demuxer::AUDIO_PORT);
            media.audio = None;
        }

        if media.video.is_none() && media.audio.is_none() {
            base.notify_error(ErrorCode::FormatNotDetected, 0);
            return Err(PipelineError::FormatNotDetected(format!(
                "no playable stream in {}",
                uri
            )));
        }

        base.with_port_mut(Demuxer::VIDEO_PORT, |p| {
            p.definition.enabled = media.video.is_some()
        })?;
        base.with_port_mut(Demuxer::AUDIO_PORT, |p| {
            p.definition.enabled = media.audio.is_some()
        })?;

        // Codec initialisation data goes out once, ahead of every packet.
        if let Some(video) = media.video.as_ref().filter(|v| !v.extra_data.is_empty()) {
            self.video
                .queue(&video.extra_data, 0, BufferFlags::EXTRA_DATA);
        }
        if let Some(audio) = media.audio.as_ref().filter(|a| !a.extra_data.is_empty()) {
            self.audio
                .queue(&audio.extra_data, 0, BufferFlags::EXTRA_DATA);
        }

        tracing::info!(
            "[{}] Opened {} (video: {:?}, audio: {:?}, duration {} us)",
            base.name(),
            uri,
            media.video.as_ref().map(|v| v.coding),
            media.audio.as_ref().map(|a| a.coding),
            media.duration_us
        );

        {
            let mut state = self.state.lock();
            state.uri = Some(uri.to_string());
            state.parser = Some(parser);
            state.media = media;
            state.eos = false;
            state.eos_notified = false;
        }
        base.notify(Event::PortFormatDetected);
        Ok(())
    }

    /// Move one packet from the parser into its track.
    fn pull(&self, base: &ComponentBase, state: &mut DemuxState) -> Pull {
        let DemuxState {
            parser,
            media,
            skip,
            discard,
            ..
        } = state;
        let Some(parser) = parser.as_mut() else {
            return Pull::Eos;
        };

        let info = match parser.peek() {
            Ok(info) => info,
            Err(status) => return self.parser_stopped(base, status),
        };

        let track = match info.kind {
            StreamKind::Video if media.video.is_some() => Some(&self.video),
            StreamKind::Audio if media.audio.is_some() => Some(&self.audio),
            _ => None,
        };
        let Some(track) = track.filter(|t| !skip.contains(t.skip_bit)) else {
            return match parser.read(discard) {
                Ok(_) => {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    Pull::Discarded
                }
                Err(status) => self.parser_stopped(base, status),
            };
        };

        let mut lists = track.lists.lock();
        let Some(id) = lists.front(ListKind::Empty) else {
            return Pull::Blocked;
        };
        let node = lists.node_mut(id);
        match parser.read(&mut node.data) {
            Ok(read) => {
                node.pts = read.pts;
                node.flags = read.flags;
                lists.move_node(id, ListKind::Empty, ListKind::Ready);
                drop(lists);
                if read.flags.contains(BufferFlags::EOS) {
                    track.eos_queued.store(true, Ordering::Release);
                }
                self.counters.read.fetch_add(1, Ordering::Relaxed);
                Pull::Queued
            }
            Err(status) => {
                drop(lists);
                self.parser_stopped(base, status)
            }
        }
    }

    fn parser_stopped(&self, base: &ComponentBase, status: ParseStatus) -> Pull {
        match status {
            ParseStatus::Eos => tracing::debug!("[{}] Parser reached end of stream", base.name()),
            ParseStatus::Failed(reason) => {
                tracing::warn!("[{}] Parser failed, ending stream: {}", base.name(), reason);
                base.notify_error(ErrorCode::Undefined, 0);
            }
        }
        Pull::Eos
    }

    /// Hand the head of a track's `ready` list downstream.
    fn drain(&self, base: &ComponentBase, track: &Track) -> Drain {
        let (id, header) = {
            let mut lists = track.lists.lock();
            let Some(id) = lists.move_front(ListKind::Ready, ListKind::Processing) else {
                return Drain::Idle;
            };
            (id, lists.node(id).header())
        };

        match base.deliver(track.port, header) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Drain::Sent
            }
            Err(e) => {
                track
                    .lists
                    .lock()
                    .requeue_front(id, ListKind::Processing, ListKind::Ready);
                self.counters.send_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[{}] Port {} hand-off refused, retrying: {}",
                    base.name(),
                    track.port,
                    e
                );
                base.notify_error(ErrorCode::Undefined, track.port);
                Drain::Failed
            }
        }
    }

    fn eos_port(state: &DemuxState) -> u32 {
        if state.media.video.is_some() {
            Demuxer::VIDEO_PORT
        } else {
            Demuxer::AUDIO_PORT
        }
    }

    fn clear_buffers(&self, base: &ComponentBase) {
        for track in self.tracks() {
            base.wait_until(
                &format!("port {} packets to come back", track.port),
                || track.lists.is_empty(ListKind::Processing),
            );
            let moved = track.lists.lock().move_all(ListKind::Ready, ListKind::Empty);
            track.eos_queued.store(false, Ordering::Release);
            tracing::debug!(
                "[{}] Port {}: {} queued packets dropped",
                base.name(),
                track.port,
                moved
            );
        }
        {
            let mut state = self.state.lock();
            state.eos = false;
            state.eos_notified = false;
        }
        for counter in [
            &self.counters.read,
            &self.counters.discarded,
            &self.counters.sent,
            &self.counters.send_failed,
            &self.counters.returned,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl ComponentLogic for DemuxerLogic {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        let state = self.state.lock();
        match param {
            Parameter::NumAvailableStreams { port, streams } => {
                *streams = match *port {
                    Demuxer::AUDIO_PORT => u32::from(state.media.audio.is_some()),
                    Demuxer::VIDEO_PORT => u32::from(state.media.video.is_some()),
                    other => return Err(PipelineError::BadPortIndex(other)),
                };
                Ok(())
            }
            Parameter::ActiveStream { port, stream } => {
                self.track(*port)?;
                *stream = 0;
                Ok(())
            }
            Parameter::VideoPortFormat(format) => {
                let video = state.media.video.as_ref().ok_or_else(|| {
                    PipelineError::FormatNotDetected("no video stream".into())
                })?;
                *format = VideoPortFormat {
                    port: Demuxer::VIDEO_PORT,
                    coding: video.coding,
                    color_format: format.color_format,
                    width: video.width,
                    height: video.height,
                };
                Ok(())
            }
            Parameter::AudioPortFormat(format) => {
                let audio = state.media.audio.as_ref().ok_or_else(|| {
                    PipelineError::FormatNotDetected("no audio stream".into())
                })?;
                *format = AudioPortFormat {
                    port: Demuxer::AUDIO_PORT,
                    coding: audio.coding,
                    channels: audio.channels,
                    sample_rate: audio.sample_rate,
                    bits_per_sample: audio.bits_per_sample,
                };
                Ok(())
            }
            Parameter::ContentUri(uri) => {
                *uri = state.uri.clone().unwrap_or_default();
                Ok(())
            }
            Parameter::SkipTrack(skip) => {
                *skip = state.skip;
                Ok(())
            }
            _ => {
                drop(state);
                base.get_port_parameter(param)
            }
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
            Parameter::ContentUri(uri) => self.open(base, uri),
            Parameter::SkipTrack(skip) => {
                self.state.lock().skip = *skip;
                tracing::debug!("[{}] Skipping tracks {:?}", base.name(), skip);
                Ok(())
            }
            Parameter::ActiveStream { port, stream } => {
                self.track(*port)?;
                if *stream != 0 {
                    return Err(PipelineError::BadParameter(format!(
                        "port {} has a single stream, {} requested",
                        port, stream
                    )));
                }
                Ok(())
            }
            _ => base.set_port_parameter(param),
        }
    }

    fn get_config(&self, base: &ComponentBase, config: &mut Config) -> Result<()> {
        match config {
            Config::SeekMode(mode) => {
                *mode = self.state.lock().seek_mode;
                Ok(())
            }
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} has no config {:?}",
                base.name(),
                other
            ))),
        }
    }

    fn set_config(&self, base: &ComponentBase, config: &Config) -> Result<()> {
        match config {
            Config::TimePosition(position) => {
                {
                    let mut state = self.state.lock();
                    let parser = state.parser.as_mut().ok_or_else(|| {
                        PipelineError::IncorrectStateOperation(base.state())
                    })?;
                    parser.seek(*position)?;
                    state.eos = false;
                    state.eos_notified = false;
                }
                tracing::info!("[{}] Seeked to {} us", base.name(), position);
                base.queue().wake();
                Ok(())
            }
            Config::SeekMode(mode) => {
                self.state.lock().seek_mode = *mode;
                Ok(())
            }
            Config::ClearBuffer => {
                self.clear_buffers(base);
                base.queue().wake();
                Ok(())
            }
            Config::ClockState(_) => Ok(()),
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} cannot set config {:?}",
                base.name(),
                other
            ))),
        }
    }

    fn empty_this_buffer(&self, _base: &ComponentBase, _buffer: &BufferHeader) -> Result<()> {
        Ok(())
    }

    fn fill_this_buffer(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        let track = self.track(buffer.output_port)?;
        {
            let mut lists = track.lists.lock();
            let Some(id) = lists.find(ListKind::Processing, |node| node.id == buffer.id) else {
                return Err(PipelineError::BadParameter(format!(
                    "buffer {} is not lent out on port {}",
                    buffer.id, track.port
                )));
            };
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
        }
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        if self.waiting_for_node.swap(false, Ordering::AcqRel) {
            base.queue().wake();
        }
        Ok(())
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        self.track(port).ok().map(|track| track.lists.counts())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("read", self.counters.read.load(Ordering::Relaxed)),
            ("discarded", self.counters.discarded.load(Ordering::Relaxed)),
            ("sent", self.counters.sent.load(Ordering::Relaxed)),
            ("send_failed", self.counters.send_failed.load(Ordering::Relaxed)),
            ("returned", self.counters.returned.load(Ordering::Relaxed)),
        ]
    }

    fn on_transition(
        &self,
        base: &ComponentBase,
        from: ComponentState,
        to: ComponentState,
    ) -> Result<()> {
        match (from, to) {
            (ComponentState::Idle, ComponentState::Executing) => {
                if self.state.lock().parser.is_none() {
                    return Err(PipelineError::IncorrectStateTransition { from, to });
                }
                Ok(())
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                for track in self.tracks() {
                    track.lists.lock().move_all(ListKind::Ready, ListKind::Empty);
                    base.wait_until(
                        &format!("port {} packets to come back", track.port),
                        || track.lists.is_empty(ListKind::Processing),
                    );
                    track.eos_queued.store(false, Ordering::Release);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process(&self, base: &ComponentBase) -> Step {
        let mut blocked = false;
        let (live, eos_pending) = {
            let mut state = self.state.lock();
            if !state.eos {
                match self.pull(base, &mut state) {
                    Pull::Queued | Pull::Discarded => {}
                    Pull::Blocked => blocked = true,
                    Pull::Eos => state.eos = true,
                }
            }
            let live: Vec<u32> = self.live_tracks(&state).iter().map(|t| t.port).collect();
            (live, state.eos && !state.eos_notified)
        };

        // A stream that ends without an end-of-stream packet still tells
        // downstream it is over.
        if eos_pending {
            for port in &live {
                let Ok(track) = self.track(*port) else { continue };
                if !track.eos_queued.load(Ordering::Acquire)
                    && !track.queue(&[], -1, BufferFlags::EOS)
                {
                    blocked = true;
                }
            }
        }

        let mut failed = false;
        let mut sent = false;
        for track in self.tracks() {
            match self.drain(base, track) {
                Drain::Idle => {}
                Drain::Sent => sent = true,
                Drain::Failed => failed = true,
            }
        }

        if eos_pending
            && !blocked
            && self.tracks().iter().all(|t| t.lists.is_empty(ListKind::Ready))
        {
            let port = {
                let mut state = self.state.lock();
                state.eos_notified = true;
                Self::eos_port(&state)
            };
            tracing::info!(
                "[{}] All packets delivered ({} sent)",
                base.name(),
                self.counters.sent.load(Ordering::Relaxed)
            );
            base.notify(Event::BufferFlag { port });
            return Step::Wait(None);
        }

        if failed {
            return Step::Wait(Some(self.retry_interval));
        }
        if blocked && !sent {
            self.waiting_for_node.store(true, Ordering::Release);
            return Step::Wait(Some(self.retry_interval));
        }
        if self.state.lock().eos_notified {
            return Step::Wait(None);
        }
        Step::Continue
    }

    fn on_exit(&self, base: &ComponentBase) {
        tracing::debug!("[{}] Exit counters: {:?}", base.name(), self.counters());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_queue_marks_eos() {
        let track = Track::new(Demuxer::VIDEO_PORT, SkipTrack::VIDEO, 2, 16);
        assert!(track.queue(b"abc", 10, BufferFlags::empty()));
        assert!(!track.eos_queued.load(Ordering::Acquire));
        assert!(track.queue(&[], -1, BufferFlags::EOS));
        assert!(track.eos_queued.load(Ordering::Acquire));
        assert!(!track.queue(b"x", 20, BufferFlags::empty()));

        let counts = track.lists.counts();
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.empty, 0);
    }

    #[test]
    fn test_packet_header_carries_node_identity() {
        let track = Track::new(Demuxer::AUDIO_PORT, SkipTrack::AUDIO, 1, 4);
        track.queue(b"pcm!", 500, BufferFlags::KEY_FRAME);
        let lists = track.lists.lock();
        let id = lists.front(ListKind::Ready).unwrap();
        let header = lists.node(id).header();
        assert_eq!(header.id, lists.node(id).id);
        assert_eq!(header.timestamp, 500);
        assert_eq!(header.payload.len(), 4);
    }
}
