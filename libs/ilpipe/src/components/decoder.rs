// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Decoder components.
//!
//! One worker drives a [`DecoderEngine`]: packets come in on port 0, decoded
//! frames leave on port 1. Both sides keep three-list pools. Input nodes
//! remember which upstream packets are still lent to the decoder; output nodes
//! remember which engine frames are lent downstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{
    AudioPortFormat, BufferCounts, BufferFlags, BufferHeader, BufferId,
    BufferPayload, BufferSupplier, ComponentBase, ComponentContext, ComponentHandle,
    ComponentHost, ComponentLogic, ComponentState, Config, DecodeStatus, DecodedFrame,
    DecoderEngine, DecoderPacket, EngineConfig, EngineFactory, ErrorCode, Event, ListKind,
    NodeLists, Parameter, PipelineError, Port, PortDomain, Result, Step, VideoPortFormat,
};

/// Compressed video in, [`VideoFrame`](crate::core::VideoFrame)s out.
pub struct VideoDecoder;

impl VideoDecoder {
    pub const IN_PORT: u32 = 0;
    pub const OUT_PORT: u32 = 1;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let logic = DecoderLogic::new(
            context,
            PortDomain::Video,
            Arc::clone(&context.backends.video_engines),
        );
        ComponentHost::spawn_handle(decoder_base(context, PortDomain::Video), logic)
    }
}

/// Compressed audio in, [`AudioFrame`](crate::core::AudioFrame)s out.
pub struct AudioDecoder;

impl AudioDecoder {
    pub const IN_PORT: u32 = 0;
    pub const OUT_PORT: u32 = 1;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let logic = DecoderLogic::new(
            context,
            PortDomain::Audio,
            Arc::clone(&context.backends.audio_engines),
        );
        ComponentHost::spawn_handle(decoder_base(context, PortDomain::Audio), logic)
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::VIDEO_DECODER, VideoDecoder::create)
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::AUDIO_DECODER, AudioDecoder::create)
}

const IN_PORT: u32 = 0;
const OUT_PORT: u32 = 1;

fn decoder_base(context: &ComponentContext, domain: PortDomain) -> ComponentBase {
    ComponentBase::new(
        context,
        vec![Port::input(IN_PORT, domain), Port::output(OUT_PORT, domain)],
    )
}

/// An upstream packet the engine has copied but upstream has not got back.
#[derive(Default)]
struct PacketSlot {
    header: Option<BufferHeader>,
}

/// An engine frame lent downstream.
struct FrameSlot<F> {
    frame: Option<F>,
}

impl<F> Default for FrameSlot<F> {
    fn default() -> Self {
        Self { frame: None }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PortFormats {
    video: VideoPortFormat,
    audio: AudioPortFormat,
}

#[derive(Default)]
struct DecoderCounters {
    packets_in: AtomicU64,
    packets_returned: AtomicU64,
    frames_sent: AtomicU64,
    frames_failed: AtomicU64,
    frames_returned: AtomicU64,
    decode_errors: AtomicU64,
}

struct DecoderLogic<F: DecodedFrame> {
    domain: PortDomain,
    factory: Arc<dyn EngineFactory<F>>,
    engine: Mutex<Option<Box<dyn DecoderEngine<Frame = F>>>>,
    formats: Mutex<PortFormats>,
    packets: NodeLists<PacketSlot>,
    frames: NodeLists<FrameSlot<F>>,
    packet_step: usize,
    frame_step: usize,
    packet_buffer_size: usize,
    frame_count: usize,
    eos_poll: Duration,
    /// Every frame of the stream has left (or can no longer leave).
    send_all: AtomicBool,
    eos_reported: AtomicBool,
    /// Upstream delivered its end-of-stream packet.
    stream_ended: AtomicBool,
    wait_for_packet: AtomicBool,
    wait_for_frame: AtomicBool,
    counters: DecoderCounters,
}

impl<F: DecodedFrame> DecoderLogic<F> {
    fn new(
        context: &ComponentContext,
        domain: PortDomain,
        factory: Arc<dyn EngineFactory<F>>,
    ) -> Self {
        let config = &context.config.decoder;
        Self {
            domain,
            factory,
            engine: Mutex::new(None),
            formats: Mutex::new(PortFormats::default()),
            packets: NodeLists::new(
                config.packet_nodes_initial,
                config.packet_nodes_max,
                PacketSlot::default,
            ),
            frames: NodeLists::new(
                config.frame_count,
                config.frame_nodes_max,
                FrameSlot::default,
            ),
            packet_step: config.packet_nodes_step.max(1),
            frame_step: config.frame_count.max(1),
            packet_buffer_size: config.packet_buffer_size,
            frame_count: config.frame_count,
            eos_poll: Duration::from_millis(config.eos_poll_interval_ms),
            send_all: AtomicBool::new(false),
            eos_reported: AtomicBool::new(false),
            stream_ended: AtomicBool::new(false),
            wait_for_packet: AtomicBool::new(false),
            wait_for_frame: AtomicBool::new(false),
            counters: DecoderCounters::default(),
        }
    }

    fn engine_config(&self) -> EngineConfig {
        let formats = *self.formats.lock();
        let coding = match self.domain {
            PortDomain::Video => formats.video.coding,
            _ => formats.audio.coding,
        };
        EngineConfig {
            coding,
            packet_buffer_size: self.packet_buffer_size,
            packet_count: self.packets.lock().max_nodes(),
            frame_count: self.frame_count,
            video: formats.video,
            audio: formats.audio,
        }
    }

    fn create_engine(&self, base: &ComponentBase) -> Result<()> {
        if self.engine.lock().is_some() {
            return Ok(());
        }
        let config = self.engine_config();
        let mut engine = self.factory.create(config.coding)?;
        engine.init(&config)?;
        *self.engine.lock() = Some(engine);
        tracing::info!("[{}] {:?} engine ready", base.name(), config.coding);
        Ok(())
    }

    fn reset_stream_flags(&self) {
        self.send_all.store(false, Ordering::Release);
        self.eos_reported.store(false, Ordering::Release);
        self.stream_ended.store(false, Ordering::Release);
    }

    /// Mark the stream finished and raise the buffer flag once.
    fn finish_stream(&self, base: &ComponentBase) {
        self.send_all.store(true, Ordering::Release);
        if !self.eos_reported.swap(true, Ordering::AcqRel) {
            tracing::info!(
                "[{}] All frames sent ({} delivered)",
                base.name(),
                self.counters.frames_sent.load(Ordering::Relaxed)
            );
            base.notify(Event::BufferFlag { port: OUT_PORT });
        }
    }

    /// Return every consumed packet upstream. Stops at the first refusal;
    /// the rest go back on a later pass.
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
            if let Err(e) = base.give_back(IN_PORT, header) {
                tracing::debug!("[{}] Packet give-back refused: {}", base.name(), e);
                return;
            }
            let mut lists = self.packets.lock();
            lists.node_mut(id).header = None;
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
            self.counters.packets_returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return every held packet upstream, retrying until accepted.
    fn return_all_packets(&self, base: &ComponentBase) {
        let held: Vec<_> = {
            let mut lists = self.packets.lock();
            lists.move_all(ListKind::Ready, ListKind::Processing);
            lists
                .iter(ListKind::Processing)
                .filter_map(|(id, slot)| slot.header.clone().map(|h| (id, h)))
                .collect()
        };
        for (id, header) in held {
            base.give_back_until_accepted(IN_PORT, header);
            let mut lists = self.packets.lock();
            lists.node_mut(id).header = None;
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
            self.counters.packets_returned.fetch_add(1, Ordering::Relaxed);
        }
        self.packets
            .lock()
            .move_all(ListKind::Processing, ListKind::Empty);
    }

    fn frame_header(frame: &F) -> BufferHeader {
        let mut header = BufferHeader::new(
            BufferId::from_raw(frame.frame_id()),
            frame.clone().into_payload(),
        );
        header.timestamp = frame.pts();
        header.flags = frame.flags();
        header
    }

    fn put_engine_frame(&self, base: &ComponentBase, frame: &F) {
        if let Some(engine) = self.engine.lock().as_mut() {
            if let Err(e) = engine.put_frame(frame) {
                tracing::debug!(
                    "[{}] Engine did not take frame {} back: {}",
                    base.name(),
                    frame.frame_id(),
                    e
                );
            }
        }
    }

    /// Hand every decoded frame downstream.
    fn drain_frames(&self, base: &ComponentBase) {
        loop {
            let frame = match self.engine.lock().as_mut() {
                Some(engine) => engine.get_frame(),
                None => None,
            };
            let Some(frame) = frame else {
                return;
            };
            let eos = frame.flags().contains(BufferFlags::EOS);

            let id = {
                let mut lists = self.frames.lock();
                if lists.is_empty(ListKind::Empty) {
                    lists.grow(self.frame_step, FrameSlot::default);
                }
                let id = lists.move_front(ListKind::Empty, ListKind::Processing);
                if let Some(id) = id {
                    lists.node_mut(id).frame = Some(frame.clone());
                }
                id
            };
            let Some(id) = id else {
                tracing::warn!(
                    "[{}] Frame pool exhausted, frame {} stays with the engine",
                    base.name(),
                    frame.frame_id()
                );
                self.put_engine_frame(base, &frame);
                self.wait_for_frame.store(true, Ordering::Release);
                return;
            };

            match base.deliver(OUT_PORT, Self::frame_header(&frame)) {
                Ok(()) => {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    {
                        let mut lists = self.frames.lock();
                        lists.node_mut(id).frame = None;
                        lists.move_node(id, ListKind::Processing, ListKind::Empty);
                    }
                    self.put_engine_frame(base, &frame);
                    self.counters.frames_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "[{}] Frame {} hand-off refused: {}",
                        base.name(),
                        frame.frame_id(),
                        e
                    );
                }
            }

            if eos {
                self.finish_stream(base);
            }
        }
    }

    fn accept_packet(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        let BufferPayload::Packet(data) = &buffer.payload else {
            return Err(PipelineError::BadParameter(format!(
                "buffer {} carries no packet",
                buffer.id
            )));
        };
        let packet = DecoderPacket {
            data,
            pts: buffer.timestamp,
            flags: buffer.flags,
        };
        let mut engine = self.engine.lock();
        let engine = engine.as_mut().ok_or_else(|| {
            PipelineError::InsufficientResources(format!("{} has no engine", base.name()))
        })?;
        engine.put_packet(packet).map_err(|e| match e {
            PipelineError::Overflow(reason) => PipelineError::Overflow(reason),
            other => PipelineError::InsufficientResources(other.to_string()),
        })
    }

    fn packet_received(&self, base: &ComponentBase, buffer: &BufferHeader) {
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        if buffer.is_eos() {
            self.stream_ended.store(true, Ordering::Release);
        }
        if self.wait_for_packet.swap(false, Ordering::AcqRel) {
            base.queue().wake();
        }
    }
}

impl<F: DecodedFrame> ComponentLogic for DecoderLogic<F> {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        match param {
            Parameter::VideoPortFormat(format) => {
                *format = VideoPortFormat {
                    port: format.port,
                    ..self.formats.lock().video
                };
                Ok(())
            }
            Parameter::AudioPortFormat(format) => {
                *format = AudioPortFormat {
                    port: format.port,
                    ..self.formats.lock().audio
                };
                Ok(())
            }
            _ => base.get_port_parameter(param),
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
            Parameter::VideoPortFormat(format) => {
                self.formats.lock().video = *format;
                Ok(())
            }
            Parameter::AudioPortFormat(format) => {
                self.formats.lock().audio = *format;
                Ok(())
            }
            _ => base.set_port_parameter(param),
        }
    }

    fn set_config(&self, base: &ComponentBase, config: &Config) -> Result<()> {
        match config {
            Config::TimePosition(position) => {
                self.return_all_packets(base);
                if let Some(engine) = self.engine.lock().as_mut() {
                    engine.reset()?;
                }
                self.reset_stream_flags();
                tracing::debug!("[{}] Flushed for position {}", base.name(), position);
                base.queue().wake();
                Ok(())
            }
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} cannot set config {:?}",
                base.name(),
                other
            ))),
        }
    }

    fn empty_this_buffer(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        let state = base.state();
        if state != ComponentState::Executing {
            return Err(PipelineError::IncorrectStateOperation(state));
        }

        if !base.is_tunneled(IN_PORT) {
            self.accept_packet(base, buffer)?;
            self.packet_received(base, buffer);
            return base.give_back(IN_PORT, buffer.clone());
        }

        if base.supplier(IN_PORT) != BufferSupplier::Output {
            return Err(PipelineError::NotImplemented(
                "decoder-supplied input buffers".into(),
            ));
        }

        {
            let mut lists = self.packets.lock();
            if lists.is_empty(ListKind::Empty)
                && lists.grow(self.packet_step, PacketSlot::default) == 0
            {
                return Err(PipelineError::InsufficientResources(format!(
                    "all {} packet nodes in use",
                    lists.total()
                )));
            }
        }

        self.accept_packet(base, buffer)?;

        {
            let mut lists = self.packets.lock();
            if let Some(id) = lists.move_front(ListKind::Empty, ListKind::Processing) {
                lists.node_mut(id).header = Some(buffer.clone());
            }
        }
        self.packet_received(base, buffer);
        Ok(())
    }

    fn fill_this_buffer(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        if buffer.output_port != OUT_PORT {
            return Err(PipelineError::BadParameter(format!(
                "frames are returned on port {}, not {}",
                OUT_PORT, buffer.output_port
            )));
        }
        let frame_id = F::from_payload(&buffer.payload)
            .map(|frame| frame.frame_id())
            .unwrap_or_else(|| buffer.id.raw());

        let frame = {
            let mut lists = self.frames.lock();
            let found = lists.find(ListKind::Processing, |slot| {
                slot.frame.as_ref().map(|f| f.frame_id()) == Some(frame_id)
            });
            let Some(id) = found else {
                return Err(PipelineError::BadParameter(format!(
                    "frame {} is not lent out",
                    frame_id
                )));
            };
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
            lists.node_mut(id).frame.take()
        };

        if let Some(frame) = frame {
            self.put_engine_frame(base, &frame);
        }
        self.counters.frames_returned.fetch_add(1, Ordering::Relaxed);
        if self.wait_for_frame.swap(false, Ordering::AcqRel) {
            base.queue().wake();
        }
        Ok(())
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        match port {
            IN_PORT => Some(self.packets.counts()),
            OUT_PORT => Some(self.frames.counts()),
            _ => None,
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let c = &self.counters;
        vec![
            ("packets_in", c.packets_in.load(Ordering::Relaxed)),
            ("packets_returned", c.packets_returned.load(Ordering::Relaxed)),
            ("frames_sent", c.frames_sent.load(Ordering::Relaxed)),
            ("frames_failed", c.frames_failed.load(Ordering::Relaxed)),
            ("frames_returned", c.frames_returned.load(Ordering::Relaxed)),
            ("decode_errors", c.decode_errors.load(Ordering::Relaxed)),
        ]
    }

    fn on_transition(
        &self,
        base: &ComponentBase,
        from: ComponentState,
        to: ComponentState,
    ) -> Result<()> {
        match (from, to) {
            (ComponentState::Loaded, ComponentState::Idle) => {
                self.create_engine(base).map_err(|e| {
                    tracing::warn!("[{}] Engine setup failed: {}", base.name(), e);
                    PipelineError::IncorrectStateTransition { from, to }
                })?;
                self.reset_stream_flags();
                Ok(())
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.return_all_packets(base);
                base.wait_until("frames to come back from downstream", || {
                    self.frames.is_empty(ListKind::Processing)
                });
                self.frames.lock().move_all(ListKind::Ready, ListKind::Empty);
                if let Some(mut engine) = self.engine.lock().take() {
                    engine.reset()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process(&self, base: &ComponentBase) -> Step {
        if base.is_tunneled(IN_PORT) {
            self.return_packets(base);
        }

        if self.send_all.load(Ordering::Acquire) {
            self.finish_stream(base);
            return Step::Wait(None);
        }

        // Flags go up before the engine is asked, so a packet or frame that
        // arrives in between still wakes the worker.
        self.wait_for_packet.store(true, Ordering::Release);
        self.wait_for_frame.store(true, Ordering::Release);
        let status = match self.engine.lock().as_mut() {
            Some(engine) => engine.decode(),
            None => DecodeStatus::Fatal(-1),
        };
        if status != DecodeStatus::NoReadyPacket {
            self.wait_for_packet.store(false, Ordering::Release);
        }
        if status != DecodeStatus::NoEmptyFrame {
            self.wait_for_frame.store(false, Ordering::Release);
        }

        if let DecodeStatus::Fatal(code) = status {
            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("[{}] Decode failed with code {}", base.name(), code);
            base.notify_error(ErrorCode::MbErrorsInFrame, code.unsigned_abs());
            self.send_all.store(true, Ordering::Release);
            return Step::Continue;
        }

        self.drain_frames(base);

        if self.send_all.load(Ordering::Acquire) {
            return Step::Wait(None);
        }
        match status {
            DecodeStatus::NoReadyPacket if self.stream_ended.load(Ordering::Acquire) => {
                Step::Wait(Some(self.eos_poll))
            }
            DecodeStatus::NoReadyPacket | DecodeStatus::NoEmptyFrame => Step::Wait(None),
            _ => Step::Continue,
        }
    }

    fn on_exit(&self, base: &ComponentBase) {
        tracing::debug!("[{}] Exit counters: {:?}", base.name(), self.counters());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AppData, AudioFrame, Backends, Coding, ComponentCallbacks, ManualTimeSource,
        PipelineConfig, VideoFrame,
    };

    #[derive(Default)]
    struct EventLog(Mutex<Vec<Event>>);

    impl ComponentCallbacks for EventLog {
        fn event_handler(&self, _component: &str, event: Event, _app_data: Option<&AppData>) {
            self.0.lock().push(event);
        }
    }

    fn context() -> ComponentContext {
        ComponentContext {
            name: "decoder-test".into(),
            config: Arc::new(PipelineConfig::default()),
            backends: Arc::new(Backends::default()),
            time: Arc::new(ManualTimeSource::new(0)),
        }
    }

    fn video_logic() -> DecoderLogic<VideoFrame> {
        let context = context();
        DecoderLogic::new(
            &context,
            PortDomain::Video,
            Arc::clone(&context.backends.video_engines),
        )
    }

    #[test]
    fn test_engine_config_follows_port_format() {
        let logic = video_logic();
        logic.formats.lock().video = VideoPortFormat {
            port: IN_PORT,
            coding: Coding::H264,
            width: 320,
            height: 240,
            ..Default::default()
        };
        let config = logic.engine_config();
        assert_eq!(config.coding, Coding::H264);
        assert_eq!(config.video.width, 320);
        assert_eq!(config.packet_count, 64);
        assert_eq!(config.frame_count, 8);
    }

    #[test]
    fn test_frame_header_uses_frame_identity() {
        let frame = VideoFrame {
            id: 7,
            pts: 40_000,
            flags: BufferFlags::EOS,
            ..Default::default()
        };
        let header = DecoderLogic::<VideoFrame>::frame_header(&frame);
        assert_eq!(header.id.raw(), 7);
        assert_eq!(header.timestamp, 40_000);
        assert!(header.is_eos());
        assert_eq!(VideoFrame::from_payload(&header.payload).map(|f| f.id), Some(7));
    }

    #[test]
    fn test_audio_decoder_rejects_video_coding() {
        let context = context();
        let logic: DecoderLogic<AudioFrame> = DecoderLogic::new(
            &context,
            PortDomain::Audio,
            Arc::clone(&context.backends.audio_engines),
        );
        logic.formats.lock().audio.coding = Coding::H264;
        let config = logic.engine_config();
        assert!(logic.factory.create(config.coding).is_err());
    }

    #[test]
    fn test_missing_engine_reports_positive_error_code() {
        let context = context();
        let base = decoder_base(&context, PortDomain::Video);
        let log = Arc::new(EventLog::default());
        base.set_callbacks(log.clone(), None);
        let logic = video_logic();

        assert_eq!(logic.process(&base), Step::Continue);
        let events = log.0.lock().clone();
        assert!(
            events.contains(&Event::error(ErrorCode::MbErrorsInFrame, 1)),
            "unexpected events {:?}",
            events
        );
        assert!(logic.send_all.load(Ordering::Acquire));
    }
}
