// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Recording muxer.
//!
//! Compressed audio and video packets are written through a [`MuxerWriter`]
//! in arrival order. Once every recorded track of the current file spans more
//! than the configured duration, the file is finished, the application is
//! told with [`Event::MuxerNeedNextFile`], and the next packet opens a new
//! file at the current content URI. Written packets go back upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{
    BufferCounts, BufferHeader, BufferPayload, Coding, ComponentBase, ComponentContext,
    ComponentHandle, ComponentHost, ComponentLogic, ComponentState, ContainerFormat, Event,
    ListKind, MuxerFactory, MuxerPacket, MuxerStreams, MuxerWriter, NodeId, NodeLists, Parameter,
    PipelineError, Port, PortDomain, RecorderFileInfo, Result, Step, StreamKind, WriteStatus,
};

/// Audio and video packets in, container files out.
pub struct Muxer;

impl Muxer {
    pub const AUDIO_PORT: u32 = 0;
    pub const VIDEO_PORT: u32 = 1;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        ComponentHost::spawn_handle(muxer_base(context), MuxerLogic::new(context))
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::MUXER, Muxer::create)
}

const AUDIO_PORT: u32 = Muxer::AUDIO_PORT;
const VIDEO_PORT: u32 = Muxer::VIDEO_PORT;

fn muxer_base(context: &ComponentContext) -> ComponentBase {
    ComponentBase::new(
        context,
        vec![
            Port::input(AUDIO_PORT, PortDomain::Audio),
            Port::input(VIDEO_PORT, PortDomain::Video),
        ],
    )
}

fn stream_kind(port: u32) -> StreamKind {
    if port == VIDEO_PORT {
        StreamKind::Video
    } else {
        StreamKind::Audio
    }
}

#[derive(Default)]
struct PacketSlot {
    header: Option<BufferHeader>,
}

/// What the application configured for the next file.
#[derive(Default)]
struct Setup {
    uri: String,
    file_info: RecorderFileInfo,
    streams: MuxerStreams,
}

/// Timestamp range one track covers in the open file.
#[derive(Debug, Clone, Copy, Default)]
struct Span {
    first: Option<i64>,
    length: i64,
}

impl Span {
    fn extend(&mut self, pts: i64) {
        let first = *self.first.get_or_insert(pts);
        self.length = pts - first;
    }
}

struct OpenFile {
    writer: Option<Box<dyn MuxerWriter>>,
    need_next_file: bool,
    video: Span,
    audio: Span,
    packets: u64,
}

impl Default for OpenFile {
    fn default() -> Self {
        Self {
            writer: None,
            need_next_file: true,
            video: Span::default(),
            audio: Span::default(),
            packets: 0,
        }
    }
}

#[derive(Default)]
struct MuxerCounters {
    received: AtomicU64,
    written: AtomicU64,
    no_space: AtomicU64,
    write_errors: AtomicU64,
    returned: AtomicU64,
    files: AtomicU64,
}

struct MuxerLogic {
    factory: Arc<dyn MuxerFactory>,
    setup: Mutex<Setup>,
    /// Only touched from the worker thread.
    file: Mutex<OpenFile>,
    packets: NodeLists<PacketSlot>,
    node_step: usize,
    retry: Duration,
    video_eos: AtomicBool,
    audio_eos: AtomicBool,
    counters: MuxerCounters,
}

impl MuxerLogic {
    fn new(context: &ComponentContext) -> Self {
        let config = &context.config.muxer;
        Self {
            factory: Arc::clone(&context.backends.muxers),
            setup: Mutex::new(Setup::default()),
            file: Mutex::new(OpenFile::default()),
            packets: NodeLists::new(
                config.packet_nodes_initial,
                config.packet_nodes_max,
                PacketSlot::default,
            ),
            node_step: config.packet_nodes_step.max(1),
            retry: Duration::from_millis(config.retry_interval_ms),
            video_eos: AtomicBool::new(false),
            audio_eos: AtomicBool::new(false),
            counters: MuxerCounters::default(),
        }
    }

    fn close_file(&self, base: &ComponentBase, file: &mut OpenFile) {
        let Some(mut writer) = file.writer.take() else {
            return;
        };
        if let Err(e) = writer.write_trailer() {
            tracing::error!("[{}] Could not finish file: {}", base.name(), e);
            base.notify_error(e.code(), 0);
        }
        tracing::info!(
            "[{}] File finished with {} packets",
            base.name(),
            file.packets
        );
    }

    /// Finish the current file and start the next one.
    fn open_next_file(&self, base: &ComponentBase, file: &mut OpenFile) -> Result<()> {
        self.close_file(base, file);
        // The setup lock is free here: the handler may set a new content URI.
        base.notify(Event::MuxerNeedNextFile);

        let (uri, container, streams) = {
            let setup = self.setup.lock();
            (setup.uri.clone(), setup.file_info.container, setup.streams)
        };
        let mut writer = self.factory.create(&uri, container, &streams)?;
        writer.write_header()?;

        *file = OpenFile {
            writer: Some(writer),
            need_next_file: false,
            ..OpenFile::default()
        };
        self.counters.files.fetch_add(1, Ordering::Relaxed);
        tracing::info!("[{}] Recording into {}", base.name(), uri);
        Ok(())
    }

    /// Account for a packet about to be written. The file is split after it
    /// once every recorded track runs past the limit.
    fn track_span(&self, file: &mut OpenFile, kind: StreamKind, pts: i64) {
        match kind {
            StreamKind::Video => file.video.extend(pts),
            _ => file.audio.extend(pts),
        }

        let (limit, has_video, has_audio) = {
            let setup = self.setup.lock();
            (
                setup.file_info.duration_us,
                setup.streams.video.is_some(),
                setup.streams.audio.is_some(),
            )
        };
        if limit <= 0 {
            return;
        }
        let video_full = file.video.length > limit;
        let audio_full = file.audio.length > limit;
        let full = match (has_video, has_audio) {
            (true, true) => video_full && audio_full,
            (true, false) => video_full,
            (false, true) => audio_full,
            (false, false) => false,
        };
        if full {
            file.need_next_file = true;
        }
    }

    fn write(&self, file: &mut OpenFile, header: &BufferHeader) -> Result<WriteStatus> {
        let BufferPayload::Packet(data) = &header.payload else {
            return Err(PipelineError::BadParameter(format!(
                "buffer {} carries no packet",
                header.id
            )));
        };
        let writer = file
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::Undefined("no file is open".into()))?;
        writer.write_packet(MuxerPacket {
            kind: stream_kind(header.input_port),
            data,
            pts: header.timestamp,
            flags: header.flags,
        })
    }

    fn written(
        &self,
        base: &ComponentBase,
        file: &mut OpenFile,
        id: NodeId,
        header: &BufferHeader,
    ) {
        self.packets
            .lock()
            .move_node(id, ListKind::Ready, ListKind::Processing);
        file.packets += 1;
        self.counters.written.fetch_add(1, Ordering::Relaxed);

        if header.is_eos() {
            let reported = match header.input_port {
                VIDEO_PORT => &self.video_eos,
                _ => &self.audio_eos,
            };
            if !reported.swap(true, Ordering::AcqRel) {
                base.notify(Event::BufferFlag {
                    port: header.input_port,
                });
            }
        }
    }

    /// Hand written packets back upstream. Stops at the first refusal.
    fn return_packets(&self, base: &ComponentBase) {
        loop {
            let (id, header) = {
                let lists = self.packets.lock();
                let Some(id) = lists.front(ListKind::Processing) else {
                    return;
                };
                let Some(header) = lists.node(id).header.clone() else {
                    return;
                };
                (id, header)
            };
            if let Err(e) = base.give_back(header.input_port, header) {
                tracing::debug!("[{}] Packet give-back refused: {}", base.name(), e);
                return;
            }
            self.release(id);
        }
    }

    fn release(&self, id: NodeId) {
        let mut lists = self.packets.lock();
        lists.node_mut(id).header = None;
        lists.move_node(id, ListKind::Processing, ListKind::Empty);
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Write out everything still queued, finish the file and return every
    /// packet upstream.
    fn flush(&self, base: &ComponentBase) {
        let mut file = self.file.lock();
        loop {
            let next = {
                let lists = self.packets.lock();
                lists
                    .front(ListKind::Ready)
                    .and_then(|id| lists.node(id).header.clone().map(|h| (id, h)))
            };
            let Some((id, header)) = next else {
                break;
            };
            match self.write(&mut file, &header) {
                Ok(WriteStatus::Written) => self.written(base, &mut file, id, &header),
                Ok(WriteStatus::NoSpace) => {
                    tracing::warn!(
                        "[{}] No space left, packet {} is not recorded",
                        base.name(),
                        header.id
                    );
                    self.packets
                        .lock()
                        .move_node(id, ListKind::Ready, ListKind::Processing);
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] Packet {} is not recorded: {}",
                        base.name(),
                        header.id,
                        e
                    );
                    self.packets
                        .lock()
                        .move_node(id, ListKind::Ready, ListKind::Processing);
                }
            }
        }
        self.close_file(base, &mut file);
        *file = OpenFile::default();
        drop(file);

        let held: Vec<_> = self
            .packets
            .lock()
            .iter(ListKind::Processing)
            .filter_map(|(id, slot)| slot.header.clone().map(|h| (id, h)))
            .collect();
        for (id, header) in held {
            base.give_back_until_accepted(header.input_port, header);
            self.release(id);
        }
        self.video_eos.store(false, Ordering::Release);
        self.audio_eos.store(false, Ordering::Release);
    }
}

impl ComponentLogic for MuxerLogic {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        let setup = self.setup.lock();
        match param {
            Parameter::ContentUri(uri) => {
                uri.clone_from(&setup.uri);
                Ok(())
            }
            Parameter::RecorderFileInfo(info) => {
                *info = setup.file_info;
                Ok(())
            }
            Parameter::VideoPortFormat(format) => {
                *format = setup.streams.video.unwrap_or_default();
                format.port = VIDEO_PORT;
                Ok(())
            }
            Parameter::AudioPortFormat(format) => {
                *format = setup.streams.audio.unwrap_or_default();
                format.port = AUDIO_PORT;
                Ok(())
            }
            _ => {
                drop(setup);
                base.get_port_parameter(param)
            }
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
            Parameter::ContentUri(uri) => {
                self.setup.lock().uri.clone_from(uri);
                base.queue().wake();
                Ok(())
            }
            Parameter::RecorderFileInfo(info) => {
                if info.container != ContainerFormat::Mp4 {
                    return Err(PipelineError::BadParameter(format!(
                        "{:?} recording is not supported",
                        info.container
                    )));
                }
                self.setup.lock().file_info = *info;
                Ok(())
            }
            Parameter::VideoPortFormat(format) => {
                if format.port != VIDEO_PORT {
                    return Err(PipelineError::BadPortIndex(format.port));
                }
                if format.coding != Coding::Mjpeg {
                    return Err(PipelineError::BadParameter(format!(
                        "{:?} video cannot be recorded",
                        format.coding
                    )));
                }
                self.setup.lock().streams.video = Some(*format);
                Ok(())
            }
            Parameter::AudioPortFormat(format) => {
                if format.port != AUDIO_PORT {
                    return Err(PipelineError::BadPortIndex(format.port));
                }
                if !format.coding.is_audio() {
                    return Err(PipelineError::BadParameter(format!(
                        "{:?} is not an audio coding",
                        format.coding
                    )));
                }
                self.setup.lock().streams.audio = Some(*format);
                Ok(())
            }
            _ => base.set_port_parameter(param),
        }
    }

    fn empty_this_buffer(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        let state = base.state();
        if state != ComponentState::Executing {
            return Err(PipelineError::IncorrectStateOperation(state));
        }
        let configured = {
            let setup = self.setup.lock();
            match buffer.input_port {
                VIDEO_PORT => setup.streams.video.is_some(),
                AUDIO_PORT => setup.streams.audio.is_some(),
                other => return Err(PipelineError::BadPortIndex(other)),
            }
        };
        if !configured {
            return Err(PipelineError::BadParameter(format!(
                "no stream is configured on port {}",
                buffer.input_port
            )));
        }
        if !matches!(buffer.payload, BufferPayload::Packet(_)) {
            return Err(PipelineError::BadParameter(format!(
                "buffer {} carries no packet",
                buffer.id
            )));
        }

        {
            let mut lists = self.packets.lock();
            if lists.is_empty(ListKind::Empty)
                && lists.grow(self.node_step, PacketSlot::default) == 0
            {
                return Err(PipelineError::InsufficientResources(format!(
                    "all {} packet nodes in use",
                    lists.total()
                )));
            }
            if let Some(id) = lists.move_front(ListKind::Empty, ListKind::Ready) {
                lists.node_mut(id).header = Some(buffer.clone());
            }
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        base.queue().wake();
        Ok(())
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        match port {
            AUDIO_PORT | VIDEO_PORT => Some(self.packets.counts()),
            _ => None,
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let c = &self.counters;
        vec![
            ("received", c.received.load(Ordering::Relaxed)),
            ("written", c.written.load(Ordering::Relaxed)),
            ("no_space", c.no_space.load(Ordering::Relaxed)),
            ("write_errors", c.write_errors.load(Ordering::Relaxed)),
            ("returned", c.returned.load(Ordering::Relaxed)),
            ("files", c.files.load(Ordering::Relaxed)),
        ]
    }

    fn on_transition(
        &self,
        base: &ComponentBase,
        from: ComponentState,
        to: ComponentState,
    ) -> Result<()> {
        match (from, to) {
            (ComponentState::Executing | ComponentState::Pause, ComponentState::Idle) => {
                self.flush(base);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process(&self, base: &ComponentBase) -> Step {
        let mut file = self.file.lock();
        if file.need_next_file {
            if let Err(e) = self.open_next_file(base, &mut file) {
                tracing::error!("[{}] Could not open the next file: {}", base.name(), e);
                base.notify_error(e.code(), 0);
                // Retried on the next message, e.g. a new content URI.
                return Step::Wait(None);
            }
        }

        self.return_packets(base);

        let head = {
            let lists = self.packets.lock();
            lists
                .front(ListKind::Ready)
                .and_then(|id| lists.node(id).header.clone().map(|h| (id, h)))
        };
        let Some((id, header)) = head else {
            return Step::Wait(None);
        };

        self.track_span(&mut file, stream_kind(header.input_port), header.timestamp);
        match self.write(&mut file, &header) {
            Ok(WriteStatus::Written) => {
                self.written(base, &mut file, id, &header);
                Step::Continue
            }
            Ok(WriteStatus::NoSpace) => {
                self.counters.no_space.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] No space left, retrying", base.name());
                Step::Wait(Some(self.retry))
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("[{}] Packet {} not written: {}", base.name(), header.id, e);
                base.notify_error(e.code(), header.input_port);
                Step::Wait(Some(self.retry))
            }
        }
    }

    fn on_exit(&self, base: &ComponentBase) {
        tracing::debug!("[{}] Exit counters: {:?}", base.name(), self.counters());
    }
}
