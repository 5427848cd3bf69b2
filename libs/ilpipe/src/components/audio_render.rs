// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Audio renderer.
//!
//! Plays decoded [`AudioFrame`]s on an [`AudioDevice`]. When its clock port
//! is tunneled, the first frame's timestamp becomes this port's start time on
//! the clock, and rendering holds until the clock runs. After that the
//! renderer periodically pushes its real play position
//! (`pts - device cache`) to the clock as the audio reference.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{
    AudioAttr, AudioDevice, AudioDeviceFactory, AudioFrame, BufferCounts, BufferFlags,
    BufferHeader, ClockState, ComponentBase, ComponentContext, ComponentHandle, ComponentHost,
    ComponentLogic, ComponentState, Config, DecodedFrame, ErrorCode, Event, Parameter,
    PipelineError, Port, PortDomain, Result, Step,
};

use super::frame_queue::FrameQueue;

/// Audio renderer component.
pub struct AudioRender;

impl AudioRender {
    pub const IN_PORT: u32 = 0;
    pub const CLOCK_PORT: u32 = 1;

    pub const MAX_VOLUME: u32 = 100;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let base = ComponentBase::new(
            context,
            vec![
                Port::input(Self::IN_PORT, PortDomain::Audio),
                Port::input(Self::CLOCK_PORT, PortDomain::Other),
            ],
        );
        ComponentHost::spawn_handle(base, AudioRenderLogic::new(context))
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::AUDIO_RENDER, AudioRender::create)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPhase {
    /// Next frame is the first of a session.
    Pending,
    /// Start time sent, waiting for the clock to run.
    WaitingForClock,
    Running,
}

struct RenderState {
    phase: StartPhase,
    /// Real time of the last clock correction, seeded by the first frame
    /// played. `None` until then.
    last_correction: Option<i64>,
    /// Last timestamp the renderer synchronised on, for drift logging.
    last_synced_pts: Option<i64>,
    /// When the worker last had a frame to render.
    last_frame_at: i64,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            phase: StartPhase::Pending,
            last_correction: None,
            last_synced_pts: None,
            last_frame_at: 0,
        }
    }
}

#[derive(Default)]
struct AudioCounters {
    rendered: AtomicU64,
    render_failed: AtomicU64,
    corrections: AtomicU64,
}

struct AudioRenderLogic {
    frames: FrameQueue,
    device_factory: AudioDeviceFactory,
    device: Mutex<Option<Box<dyn AudioDevice>>>,
    state: Mutex<RenderState>,
    volume: AtomicU32,
    volume_pending: AtomicBool,
    clock_running: AtomicBool,
    frame_end: AtomicBool,
    send_all: AtomicBool,
    eos_reported: AtomicBool,
    frame_wait: Duration,
    start_wait: Duration,
    starvation_timeout_us: Option<i64>,
    correction_interval_us: i64,
    counters: AudioCounters,
}

impl AudioRenderLogic {
    fn new(context: &ComponentContext) -> Self {
        let config = &context.config.audio_render;
        Self {
            frames: FrameQueue::new(
                AudioRender::IN_PORT,
                config.frame_nodes_initial,
                config.frame_nodes_step,
                config.frame_nodes_max,
            ),
            device_factory: context.backends.audio_device.clone(),
            device: Mutex::new(None),
            state: Mutex::new(RenderState::default()),
            volume: AtomicU32::new(AudioRender::MAX_VOLUME),
            volume_pending: AtomicBool::new(false),
            clock_running: AtomicBool::new(false),
            frame_end: AtomicBool::new(false),
            send_all: AtomicBool::new(false),
            eos_reported: AtomicBool::new(false),
            frame_wait: Duration::from_millis(config.frame_wait_interval_ms),
            start_wait: Duration::from_millis(config.start_wait_ms.max(1)),
            starvation_timeout_us: config
                .starvation_timeout_ms
                .map(|ms| i64::try_from(ms.saturating_mul(1000)).unwrap_or(i64::MAX)),
            correction_interval_us: config.correction_interval_us,
            counters: AudioCounters::default(),
        }
    }

    fn ensure_device(&self, base: &ComponentBase) -> Result<()> {
        let mut device = self.device.lock();
        if device.is_some() {
            return Ok(());
        }
        let mut created = (self.device_factory)()?;
        created.init()?;
        tracing::debug!("[{}] Audio device initialised", base.name());
        *device = Some(created);
        self.volume_pending.store(true, Ordering::Release);
        Ok(())
    }

    fn apply_volume(&self, base: &ComponentBase, device: &mut dyn AudioDevice) {
        if !self.volume_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let volume = self.volume.load(Ordering::Acquire);
        if let Err(e) = device.set_volume(volume) {
            tracing::warn!("[{}] Setting volume {} failed: {}", base.name(), volume, e);
        }
    }

    fn reset_session(&self) {
        *self.state.lock() = RenderState::default();
        self.send_all.store(false, Ordering::Release);
        self.eos_reported.store(false, Ordering::Release);
        self.frame_end.store(false, Ordering::Release);
    }

    fn finish_stream(&self, base: &ComponentBase) {
        self.send_all.store(true, Ordering::Release);
        if !self.eos_reported.swap(true, Ordering::AcqRel) {
            tracing::info!(
                "[{}] All frames rendered ({} played)",
                base.name(),
                self.counters.rendered.load(Ordering::Relaxed)
            );
            base.notify(Event::BufferFlag {
                port: AudioRender::IN_PORT,
            });
        }
    }

    /// First frame of a session: device setup and clock alignment. Returns
    /// `false` while the clock has yet to start.
    fn start(&self, base: &ComponentBase, frame: Option<&AudioFrame>, pts: i64) -> Result<bool> {
        let phase = self.state.lock().phase;
        if phase == StartPhase::Pending {
            self.ensure_device(base)?;
            if let Some(frame) = frame {
                let attr = AudioAttr {
                    channels: frame.channels,
                    sample_rate: frame.sample_rate,
                    bits_per_sample: frame.bits_per_sample,
                };
                if let Some(device) = self.device.lock().as_mut() {
                    device.set_attr(attr)?;
                }
            }

            let mut next = StartPhase::Running;
            if let Some((clock, clock_port)) = base.tunnel_peer(AudioRender::CLOCK_PORT)? {
                let start = Config::ClientStartTime {
                    port: clock_port,
                    timestamp: pts,
                };
                match clock.set_config(&start) {
                    Ok(()) => next = StartPhase::WaitingForClock,
                    Err(e) => tracing::warn!(
                        "[{}] Clock refused start time {}, playing free-running: {}",
                        base.name(),
                        pts,
                        e
                    ),
                }
            }
            self.state.lock().phase = next;
        }

        let mut state = self.state.lock();
        if state.phase == StartPhase::WaitingForClock {
            if !self.clock_running.load(Ordering::Acquire) {
                return Ok(false);
            }
            state.phase = StartPhase::Running;
        }
        state.last_synced_pts = Some(pts);
        Ok(true)
    }

    /// Push the real play position to the clock, at most once per interval.
    fn correct_clock(&self, base: &ComponentBase, real_time: i64) {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_correction {
                if real_time - last < self.correction_interval_us {
                    return;
                }
            }
            state.last_correction = Some(real_time);
            if let Some(previous) = state.last_synced_pts.replace(real_time) {
                tracing::trace!(
                    "[{}] Audio reference {} ({} since last sync)",
                    base.name(),
                    real_time,
                    real_time - previous
                );
            }
        }

        let Ok(Some((clock, clock_port))) = base.tunnel_peer(AudioRender::CLOCK_PORT) else {
            return;
        };
        let reference = Config::CurrentAudioReference {
            port: clock_port,
            timestamp: real_time,
        };
        match clock.set_config(&reference) {
            Ok(()) => {
                self.counters.corrections.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!("[{}] Clock correction refused: {}", base.name(), e),
        }
    }

    fn render(&self, base: &ComponentBase, header: &BufferHeader) -> Result<Step> {
        let frame = AudioFrame::from_payload(&header.payload);
        let first = self.state.lock().phase != StartPhase::Running;
        if first && !self.start(base, frame, header.timestamp)? {
            return Ok(Step::Wait(Some(self.start_wait)));
        }

        let real_time = {
            let mut device = self.device.lock();
            let device = device
                .as_mut()
                .ok_or_else(|| PipelineError::Undefined("audio device not created".into()))?;
            self.apply_volume(base, device.as_mut());
            if let Some(frame) = frame.filter(|f| !f.data.is_empty()) {
                device.render(&frame.data)?;
                self.counters.rendered.fetch_add(1, Ordering::Relaxed);
            }
            header.timestamp - device.cached_time_us()
        };

        let first_played = {
            let mut state = self.state.lock();
            let first_played = state.last_correction.is_none();
            state.last_correction.get_or_insert(real_time);
            first_played
        };
        if first_played {
            base.notify(Event::AudioRenderFirstFrame);
        } else if base.is_tunneled(AudioRender::CLOCK_PORT) {
            self.correct_clock(base, real_time);
        }
        base.notify(Event::AudioRenderPts(real_time));
        Ok(Step::Continue)
    }

    fn starved(&self, base: &ComponentBase) -> bool {
        let Some(timeout) = self.starvation_timeout_us else {
            return false;
        };
        let state = self.state.lock();
        state.phase == StartPhase::Running && base.now_us() - state.last_frame_at > timeout
    }
}

impl ComponentLogic for AudioRenderLogic {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        match param {
            Parameter::AudioVolume(volume) => {
                *volume = self.volume.load(Ordering::Acquire);
                Ok(())
            }
            Parameter::FrameEnd(end) => {
                *end = self.frame_end.load(Ordering::Acquire);
                Ok(())
            }
            _ => base.get_port_parameter(param),
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
            Parameter::AudioVolume(volume) => {
                self.volume
                    .store((*volume).min(AudioRender::MAX_VOLUME), Ordering::Release);
                self.volume_pending.store(true, Ordering::Release);
                Ok(())
            }
            Parameter::FrameEnd(end) => {
                self.frame_end.store(*end, Ordering::Release);
                base.queue().wake();
                Ok(())
            }
            _ => base.set_port_parameter(param),
        }
    }

    fn set_config(&self, base: &ComponentBase, config: &Config) -> Result<()> {
        match config {
            Config::AudioRenderInit => self.ensure_device(base).map_err(|e| {
                PipelineError::InsufficientResources(format!("audio device: {}", e))
            }),
            Config::ClockState(clock) => {
                let running = clock.state == ClockState::Running;
                self.clock_running.store(running, Ordering::Release);
                tracing::debug!("[{}] Clock is {}", base.name(), clock.state);
                if running {
                    base.queue().wake();
                }
                Ok(())
            }
            Config::TimePosition(position) => {
                self.frames.flush(base);
                if let Some(device) = self.device.lock().as_mut() {
                    device.clear_cache()?;
                }
                self.clock_running.store(false, Ordering::Release);
                self.reset_session();
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
        if !matches!(state, ComponentState::Executing | ComponentState::Pause) {
            return Err(PipelineError::IncorrectStateOperation(state));
        }
        self.frames.accept(base, buffer)
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        (port == AudioRender::IN_PORT).then(|| self.frames.counts())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("received", self.frames.received.load(Ordering::Relaxed)),
            ("rendered", self.counters.rendered.load(Ordering::Relaxed)),
            ("render_failed", self.counters.render_failed.load(Ordering::Relaxed)),
            ("corrections", self.counters.corrections.load(Ordering::Relaxed)),
            ("returned", self.frames.returned.load(Ordering::Relaxed)),
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
                self.reset_session();
                Ok(())
            }
            (ComponentState::Executing, ComponentState::Pause) => {
                if let Some(device) = self.device.lock().as_mut() {
                    device.pause()?;
                }
                Ok(())
            }
            (ComponentState::Pause, ComponentState::Executing) => {
                // Starvation is measured from the resume, not across the pause.
                self.state.lock().last_frame_at = base.now_us();
                Ok(())
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.frames.flush(base);
                if let Some(mut device) = self.device.lock().take() {
                    device.clear_cache()?;
                }
                self.clock_running.store(false, Ordering::Release);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process(&self, base: &ComponentBase) -> Step {
        self.frames.return_rendered(base, None, false);

        if self.send_all.load(Ordering::Acquire) {
            self.finish_stream(base);
            return Step::Wait(None);
        }

        let Some((id, header)) = self.frames.head() else {
            if self.frame_end.load(Ordering::Acquire) {
                self.finish_stream(base);
                return Step::Wait(None);
            }
            if self.starved(base) {
                tracing::warn!(
                    "[{}] No frame for over {} us, treating the stream as ended",
                    base.name(),
                    self.starvation_timeout_us.unwrap_or_default()
                );
                self.finish_stream(base);
                return Step::Wait(None);
            }
            if self.frames.prepare_wait() {
                return Step::Continue;
            }
            return Step::Wait(Some(self.frame_wait));
        };

        self.state.lock().last_frame_at = base.now_us();

        // Audio is never dropped: a frame that fails stays at the head and
        // is tried again.
        match self.render(base, &header) {
            Ok(Step::Continue) => {}
            Ok(step) => return step,
            Err(e) => {
                self.counters.render_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Rendering frame {} failed: {}", base.name(), header.id, e);
                base.notify_error(ErrorCode::Undefined, AudioRender::IN_PORT);
                return Step::Wait(Some(self.frame_wait));
            }
        }

        self.frames.mark_rendered(id);
        self.frames.return_rendered(base, None, false);
        if header.flags.contains(BufferFlags::EOS) {
            self.finish_stream(base);
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
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::core::{
        Backends, BufferId, BufferPayload, ManualTimeSource, NullAudioStats, PipelineConfig,
    };

    /// Device whose `render` fails a set number of times before working.
    struct FlakyAudioDevice {
        failures_left: Arc<AtomicU32>,
        played: Arc<AtomicU64>,
    }

    impl AudioDevice for FlakyAudioDevice {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_attr(&mut self, _attr: AudioAttr) -> Result<()> {
            Ok(())
        }

        fn set_volume(&mut self, _volume: u32) -> Result<()> {
            Ok(())
        }

        fn volume(&self) -> Result<u32> {
            Ok(AudioRender::MAX_VOLUME)
        }

        fn render(&mut self, _data: &[u8]) -> Result<()> {
            let left = self.failures_left.load(Ordering::Acquire);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Release);
                return Err(PipelineError::Undefined("device underrun".into()));
            }
            self.played.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn cached_time_us(&self) -> i64 {
            0
        }

        fn pause(&mut self) -> Result<()> {
            Ok(())
        }

        fn clear_cache(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn audio_ports() -> Vec<Port> {
        vec![
            Port::input(AudioRender::IN_PORT, PortDomain::Audio),
            Port::input(AudioRender::CLOCK_PORT, PortDomain::Other),
        ]
    }

    fn audio_header(pts: i64) -> BufferHeader {
        let frame = AudioFrame {
            id: 1,
            pts,
            flags: BufferFlags::empty(),
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            data: Bytes::from(vec![0u8; 32]),
        };
        let mut header = BufferHeader::new(BufferId::next(), BufferPayload::Audio(frame));
        header.timestamp = pts;
        header
    }

    fn counter(logic: &AudioRenderLogic, name: &str) -> u64 {
        logic
            .counters()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
    }

    fn context(stats: Arc<NullAudioStats>) -> ComponentContext {
        ComponentContext {
            name: "audio-render-test".into(),
            config: Arc::new(PipelineConfig::default()),
            backends: Arc::new(Backends::default().with_audio_stats(stats)),
            time: Arc::new(ManualTimeSource::new(0)),
        }
    }

    #[test]
    fn test_volume_is_clamped_and_applied_on_next_frame() {
        let stats = Arc::new(NullAudioStats::default());
        let context = context(Arc::clone(&stats));
        let base = ComponentBase::new(&context, vec![]);
        let logic = AudioRenderLogic::new(&context);

        logic
            .set_parameter(&base, &Parameter::AudioVolume(250))
            .unwrap();
        let mut volume = Parameter::AudioVolume(0);
        logic.get_parameter(&base, &mut volume).unwrap();
        assert_eq!(volume, Parameter::AudioVolume(100));

        logic.ensure_device(&base).unwrap();
        let mut device = logic.device.lock().take().unwrap();
        logic.apply_volume(&base, device.as_mut());
        assert_eq!(stats.volume.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_starvation_only_after_start() {
        let stats = Arc::new(NullAudioStats::default());
        let mut config = PipelineConfig::default();
        config.audio_render.starvation_timeout_ms = Some(1);
        let time = Arc::new(ManualTimeSource::new(0));
        let context = ComponentContext {
            name: "audio-render-test".into(),
            config: Arc::new(config),
            backends: Arc::new(Backends::default().with_audio_stats(stats)),
            time: time.clone(),
        };
        let base = ComponentBase::new(&context, vec![]);
        let logic = AudioRenderLogic::new(&context);

        time.advance(10_000);
        assert!(!logic.starved(&base));

        logic.state.lock().phase = StartPhase::Running;
        logic.state.lock().last_frame_at = 5_000;
        assert!(logic.starved(&base));
        logic.state.lock().last_frame_at = 9_500;
        assert!(!logic.starved(&base));
    }

    #[test]
    fn test_starvation_heuristic_can_be_disabled() {
        let stats = Arc::new(NullAudioStats::default());
        let mut config = PipelineConfig::default();
        config.audio_render.starvation_timeout_ms = None;
        let context = ComponentContext {
            name: "audio-render-test".into(),
            config: Arc::new(config),
            backends: Arc::new(Backends::default().with_audio_stats(stats)),
            time: Arc::new(ManualTimeSource::new(1_000_000_000)),
        };
        let base = ComponentBase::new(&context, vec![]);
        let logic = AudioRenderLogic::new(&context);
        logic.state.lock().phase = StartPhase::Running;
        assert!(!logic.starved(&base));
    }

    #[test]
    fn test_failed_frame_is_retried_not_returned() {
        let failures_left = Arc::new(AtomicU32::new(2));
        let played = Arc::new(AtomicU64::new(0));
        let device_failures = Arc::clone(&failures_left);
        let device_played = Arc::clone(&played);
        let context = ComponentContext {
            name: "audio-render-test".into(),
            config: Arc::new(PipelineConfig::default()),
            backends: Arc::new(Backends::default().with_audio_device(Arc::new(move || {
                Ok(Box::new(FlakyAudioDevice {
                    failures_left: Arc::clone(&device_failures),
                    played: Arc::clone(&device_played),
                }) as Box<dyn AudioDevice>)
            }))),
            time: Arc::new(ManualTimeSource::new(0)),
        };
        let base = ComponentBase::new(&context, audio_ports());
        let logic = AudioRenderLogic::new(&context);
        logic.frames.accept(&base, &audio_header(0)).unwrap();

        for attempt in 1..=2 {
            assert_eq!(logic.process(&base), Step::Wait(Some(logic.frame_wait)));
            assert_eq!(counter(&logic, "render_failed"), attempt);
            assert_eq!(logic.frames.counts().ready, 1, "frame must stay queued");
            assert_eq!(counter(&logic, "returned"), 0);
        }

        assert_eq!(logic.process(&base), Step::Continue);
        assert_eq!(played.load(Ordering::Relaxed), 1);
        assert_eq!(counter(&logic, "rendered"), 1);
        assert_eq!(counter(&logic, "returned"), 1);
        assert_eq!(logic.frames.counts().ready, 0);
    }

    #[test]
    fn test_first_frame_seeds_correction_interval() {
        let stats = Arc::new(NullAudioStats::default());
        let context = context(stats);
        let base = ComponentBase::new(&context, audio_ports());
        let logic = AudioRenderLogic::new(&context);

        logic.frames.accept(&base, &audio_header(40_000)).unwrap();
        assert_eq!(logic.process(&base), Step::Continue);
        assert_eq!(logic.state.lock().last_correction, Some(40_000));

        // Half an interval after the first frame: too early.
        logic.correct_clock(&base, 540_000);
        assert_eq!(logic.state.lock().last_correction, Some(40_000));

        logic.correct_clock(&base, 1_040_000);
        assert_eq!(logic.state.lock().last_correction, Some(1_040_000));
    }
}
