// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Video encoder.
//!
//! Raw pictures come in on port 0 and are encoded one at a time by an
//! [`EncoderEngine`]. Each packet leaves on port 1 and stays lent until the
//! consumer hands it back. A picture is returned upstream once its packet is
//! accepted downstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{
    BufferCounts, BufferFlags, BufferHeader, BufferId, BufferPayload, BufferSupplier, Coding,
    ComponentBase, ComponentContext, ComponentHandle, ComponentHost, ComponentLogic,
    ComponentState, EncoderEngine, EncoderFactory, EncoderSettings, Event, ListKind, NodeId,
    NodeLists, Parameter, PipelineError, Port, PortDomain, Result, Step, VideoPortFormat,
};

/// Raw [`VideoFrame`](crate::core::VideoFrame)s in, compressed packets out.
pub struct VideoEncoder;

impl VideoEncoder {
    pub const IN_PORT: u32 = 0;
    pub const OUT_PORT: u32 = 1;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        ComponentHost::spawn_handle(encoder_base(context), EncoderLogic::new(context))
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::VIDEO_ENCODER, VideoEncoder::create)
}

const IN_PORT: u32 = VideoEncoder::IN_PORT;
const OUT_PORT: u32 = VideoEncoder::OUT_PORT;

fn encoder_base(context: &ComponentContext) -> ComponentBase {
    ComponentBase::new(
        context,
        vec![
            Port::input(IN_PORT, PortDomain::Video),
            Port::output(OUT_PORT, PortDomain::Video),
        ],
    )
}

/// A picture from upstream, queued or waiting to be handed back.
#[derive(Default)]
struct FrameSlot {
    header: Option<BufferHeader>,
}

/// A packet lent downstream.
#[derive(Default)]
struct PacketSlot {
    id: Option<BufferId>,
}

#[derive(Default)]
struct EncoderCounters {
    frames_in: AtomicU64,
    frames_returned: AtomicU64,
    packets_sent: AtomicU64,
    send_failed: AtomicU64,
    packets_returned: AtomicU64,
    encode_errors: AtomicU64,
}

struct EncoderLogic {
    factory: Arc<dyn EncoderFactory>,
    engine: Mutex<Option<Box<dyn EncoderEngine>>>,
    settings: Mutex<EncoderSettings>,
    frames: NodeLists<FrameSlot>,
    packets: NodeLists<PacketSlot>,
    node_step: usize,
    retry: Duration,
    wait_for_packet: AtomicBool,
    eos_reported: AtomicBool,
    counters: EncoderCounters,
}

impl EncoderLogic {
    fn new(context: &ComponentContext) -> Self {
        let config = &context.config.video_encoder;
        Self {
            factory: Arc::clone(&context.backends.video_encoders),
            engine: Mutex::new(None),
            settings: Mutex::new(EncoderSettings {
                coding: Coding::Mjpeg,
                width: 0,
                height: 0,
                quality: config.default_quality,
            }),
            frames: NodeLists::new(
                config.frame_nodes_initial,
                config.frame_nodes_max,
                FrameSlot::default,
            ),
            packets: NodeLists::new(
                config.frame_nodes_initial,
                config.packet_nodes_max,
                PacketSlot::default,
            ),
            node_step: config.frame_nodes_step.max(1),
            retry: Duration::from_millis(config.retry_interval_ms),
            wait_for_packet: AtomicBool::new(false),
            eos_reported: AtomicBool::new(false),
            counters: EncoderCounters::default(),
        }
    }

    fn create_engine(&self, base: &ComponentBase) -> Result<()> {
        let settings = *self.settings.lock();
        let mut engine = self.factory.create(settings.coding)?;
        engine.init(&settings)?;
        *self.engine.lock() = Some(engine);
        tracing::info!(
            "[{}] {:?} encoder ready for {}x{} at quality {}",
            base.name(),
            settings.coding,
            settings.width,
            settings.height,
            settings.quality
        );
        Ok(())
    }

    /// Hand encoded pictures back upstream. Stops at the first refusal.
    fn return_frames(&self, base: &ComponentBase) {
        loop {
            let (id, header) = {
                let lists = self.frames.lock();
                let Some(id) = lists.front(ListKind::Processing) else {
                    return;
                };
                let Some(header) = lists.node(id).header.clone() else {
                    return;
                };
                (id, header)
            };
            if let Err(e) = base.give_back(IN_PORT, header) {
                tracing::debug!("[{}] Picture give-back refused: {}", base.name(), e);
                return;
            }
            self.release_frame(id);
        }
    }

    fn return_all_frames(&self, base: &ComponentBase) {
        let held: Vec<_> = {
            let mut lists = self.frames.lock();
            lists.move_all(ListKind::Ready, ListKind::Processing);
            lists
                .iter(ListKind::Processing)
                .filter_map(|(id, slot)| slot.header.clone().map(|h| (id, h)))
                .collect()
        };
        for (id, header) in held {
            base.give_back_until_accepted(IN_PORT, header);
            self.release_frame(id);
        }
        self.frames
            .lock()
            .move_all(ListKind::Processing, ListKind::Empty);
    }

    fn release_frame(&self, id: NodeId) {
        let mut lists = self.frames.lock();
        lists.node_mut(id).header = None;
        lists.move_node(id, ListKind::Processing, ListKind::Empty);
        self.counters.frames_returned.fetch_add(1, Ordering::Relaxed);
    }

    fn release_packet(&self, id: NodeId) {
        let mut lists = self.packets.lock();
        lists.node_mut(id).id = None;
        lists.move_node(id, ListKind::Processing, ListKind::Empty);
    }

    /// Take a packet node for the next output, growing the pool if allowed.
    fn claim_packet(&self, buffer: BufferId) -> Option<NodeId> {
        let mut lists = self.packets.lock();
        if lists.is_empty(ListKind::Empty) {
            lists.grow(self.node_step, PacketSlot::default);
        }
        let id = lists.move_front(ListKind::Empty, ListKind::Processing)?;
        lists.node_mut(id).id = Some(buffer);
        Some(id)
    }

    fn report_end_of_stream(&self, base: &ComponentBase) {
        if !self.eos_reported.swap(true, Ordering::AcqRel) {
            tracing::info!(
                "[{}] End of stream after {} packets",
                base.name(),
                self.counters.packets_sent.load(Ordering::Relaxed)
            );
            base.notify(Event::BufferFlag { port: OUT_PORT });
        }
    }
}

impl ComponentLogic for EncoderLogic {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        match param {
            Parameter::VideoPortFormat(format) => {
                let settings = *self.settings.lock();
                *format = VideoPortFormat {
                    port: format.port,
                    coding: if format.port == OUT_PORT {
                        settings.coding
                    } else {
                        Coding::Unused
                    },
                    width: settings.width,
                    height: settings.height,
                    ..Default::default()
                };
                Ok(())
            }
            Parameter::QFactor(quality) => {
                *quality = self.settings.lock().quality;
                Ok(())
            }
            _ => base.get_port_parameter(param),
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
            Parameter::VideoPortFormat(format) => {
                let mut settings = self.settings.lock();
                if format.port == OUT_PORT && format.coding != Coding::Unused {
                    if !format.coding.is_video() {
                        return Err(PipelineError::BadParameter(format!(
                            "{:?} is not a video coding",
                            format.coding
                        )));
                    }
                    settings.coding = format.coding;
                }
                settings.width = format.width;
                settings.height = format.height;
                Ok(())
            }
            Parameter::QFactor(quality) => {
                if !(1..=100).contains(quality) {
                    return Err(PipelineError::BadParameter(format!(
                        "quality {} is outside 1..=100",
                        quality
                    )));
                }
                self.settings.lock().quality = *quality;
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
        if base.is_tunneled(IN_PORT) && base.supplier(IN_PORT) != BufferSupplier::Output {
            return Err(PipelineError::NotImplemented(
                "encoder-supplied input buffers".into(),
            ));
        }
        if !matches!(buffer.payload, BufferPayload::Video(_)) {
            return Err(PipelineError::BadParameter(format!(
                "buffer {} carries no picture",
                buffer.id
            )));
        }

        {
            let mut lists = self.frames.lock();
            if lists.is_empty(ListKind::Empty)
                && lists.grow(self.node_step, FrameSlot::default) == 0
            {
                return Err(PipelineError::InsufficientResources(format!(
                    "all {} picture nodes in use",
                    lists.total()
                )));
            }
            if let Some(id) = lists.move_front(ListKind::Empty, ListKind::Ready) {
                lists.node_mut(id).header = Some(buffer.clone());
            }
        }
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        base.queue().wake();
        Ok(())
    }

    fn fill_this_buffer(&self, base: &ComponentBase, buffer: &BufferHeader) -> Result<()> {
        if buffer.output_port != OUT_PORT {
            return Err(PipelineError::BadParameter(format!(
                "packets are returned on port {}, not {}",
                OUT_PORT, buffer.output_port
            )));
        }
        {
            let mut lists = self.packets.lock();
            let Some(id) = lists.find(ListKind::Processing, |slot| slot.id == Some(buffer.id))
            else {
                return Err(PipelineError::BadParameter(format!(
                    "packet {} is not lent out",
                    buffer.id
                )));
            };
            lists.node_mut(id).id = None;
            lists.move_node(id, ListKind::Processing, ListKind::Empty);
        }
        self.counters.packets_returned.fetch_add(1, Ordering::Relaxed);
        if self.wait_for_packet.swap(false, Ordering::AcqRel) {
            base.queue().wake();
        }
        Ok(())
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        match port {
            IN_PORT => Some(self.frames.counts()),
            OUT_PORT => Some(self.packets.counts()),
            _ => None,
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let c = &self.counters;
        vec![
            ("frames_in", c.frames_in.load(Ordering::Relaxed)),
            ("frames_returned", c.frames_returned.load(Ordering::Relaxed)),
            ("packets_sent", c.packets_sent.load(Ordering::Relaxed)),
            ("send_failed", c.send_failed.load(Ordering::Relaxed)),
            ("packets_returned", c.packets_returned.load(Ordering::Relaxed)),
            ("encode_errors", c.encode_errors.load(Ordering::Relaxed)),
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
                    tracing::warn!("[{}] Encoder setup failed: {}", base.name(), e);
                    PipelineError::IncorrectStateTransition { from, to }
                })?;
                self.eos_reported.store(false, Ordering::Release);
                Ok(())
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.return_all_frames(base);
                base.wait_until("packets to come back from downstream", || {
                    self.packets.is_empty(ListKind::Processing)
                });
                self.engine.lock().take();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process(&self, base: &ComponentBase) -> Step {
        self.return_frames(base);

        let (frame_node, header) = {
            let lists = self.frames.lock();
            let Some(id) = lists.front(ListKind::Ready) else {
                return Step::Wait(None);
            };
            let Some(header) = lists.node(id).header.clone() else {
                return Step::Wait(None);
            };
            (id, header)
        };
        let BufferPayload::Video(frame) = &header.payload else {
            return Step::Wait(None);
        };

        // Raised before the pool is checked, so a packet returned in between
        // still wakes the worker.
        self.wait_for_packet.store(true, Ordering::Release);
        let packet_id = BufferId::next();
        let Some(packet_node) = self.claim_packet(packet_id) else {
            tracing::trace!("[{}] Every packet is lent out", base.name());
            return Step::Wait(None);
        };
        self.wait_for_packet.store(false, Ordering::Release);

        let encoded = match self.engine.lock().as_mut() {
            Some(engine) => engine.encode(frame),
            None => Err(PipelineError::Undefined(format!(
                "{} has no engine",
                base.name()
            ))),
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                self.release_packet(packet_node);
                self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "[{}] Picture {} could not be encoded: {}",
                    base.name(),
                    header.id,
                    e
                );
                base.notify_error(e.code(), IN_PORT);
                // Returned unencoded.
                self.frames
                    .lock()
                    .move_node(frame_node, ListKind::Ready, ListKind::Processing);
                return Step::Continue;
            }
        };

        let eos = encoded.flags.contains(BufferFlags::EOS);
        let packet = BufferHeader::packet(packet_id, encoded.data, encoded.pts, encoded.flags);
        if let Err(e) = base.deliver(OUT_PORT, packet) {
            self.release_packet(packet_node);
            self.counters.send_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{}] Packet hand-off refused: {}", base.name(), e);
            return Step::Wait(Some(self.retry));
        }

        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.frames
            .lock()
            .move_node(frame_node, ListKind::Ready, ListKind::Processing);
        if eos {
            self.report_end_of_stream(base);
        }
        Step::Continue
    }

    fn on_exit(&self, base: &ComponentBase) {
        tracing::debug!("[{}] Exit counters: {:?}", base.name(), self.counters());
    }
}
