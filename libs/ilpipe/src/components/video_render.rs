// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Video renderer.
//!
//! Shows decoded [`VideoFrame`]s on a [`VideoDisplay`] at their presentation
//! time. Media time comes from the tunneled clock when there is one, else
//! from the renderer's own clock, started at the first frame. The last shown
//! frame stays lent to the renderer until a newer one replaces it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{
    BufferCounts, BufferFlags, BufferHeader, ClockState, ComponentBase, ComponentContext,
    ComponentHandle, ComponentHost, ComponentLogic, ComponentState, Config, DecodedFrame,
    ErrorCode, Event, NodeId, Parameter, PipelineError, Port, PortDomain, Result, Step,
    VideoDisplay, VideoDisplayFactory, VideoFrame,
};

use super::frame_queue::FrameQueue;

/// Video renderer component.
pub struct VideoRender;

impl VideoRender {
    pub const IN_PORT: u32 = 0;
    pub const CLOCK_PORT: u32 = 1;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let base = ComponentBase::new(
            context,
            vec![
                Port::input(Self::IN_PORT, PortDomain::Video),
                Port::input(Self::CLOCK_PORT, PortDomain::Other),
            ],
        );
        ComponentHost::spawn_handle(base, VideoRenderLogic::new(context))
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::VIDEO_RENDER, VideoRender::create)
}

/// Renderer-local media clock: `pts = anchor_pts + (now - anchor_wall)`.
#[derive(Debug, Clone, Copy, Default)]
struct OwnClock {
    anchor_pts: i64,
    anchor_wall: i64,
    paused_at: Option<i64>,
}

impl OwnClock {
    fn anchor(&mut self, pts: i64, now: i64) {
        self.anchor_pts = pts;
        self.anchor_wall = now;
    }

    fn media_time(&self, now: i64) -> i64 {
        self.anchor_pts + (self.paused_at.unwrap_or(now) - self.anchor_wall)
    }

    fn pause(&mut self, now: i64) {
        self.paused_at.get_or_insert(now);
    }

    fn resume(&mut self, now: i64) {
        if let Some(paused_at) = self.paused_at.take() {
            self.anchor_wall += now - paused_at;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPhase {
    Pending,
    WaitingForClock,
    Running,
}

/// Where a media time reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeBase {
    Clock,
    Own,
}

/// What to do with a frame given its distance from the media time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Wait(i64),
    Show,
    Drop,
}

struct RenderState {
    phase: StartPhase,
    own_clock: OwnClock,
    /// Node of the frame currently on screen.
    shown: Option<NodeId>,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            phase: StartPhase::Pending,
            own_clock: OwnClock::default(),
            shown: None,
        }
    }
}

#[derive(Default)]
struct VideoCounters {
    shown: AtomicU64,
    dropped: AtomicU64,
    render_failed: AtomicU64,
    discontinuities: AtomicU64,
}

struct VideoRenderLogic {
    frames: FrameQueue,
    display_factory: VideoDisplayFactory,
    display: Mutex<Option<Box<dyn VideoDisplay>>>,
    state: Mutex<RenderState>,
    clock_running: AtomicBool,
    frame_end: AtomicBool,
    send_all: AtomicBool,
    eos_reported: AtomicBool,
    sync_tolerance_us: i64,
    pts_jump_threshold_us: i64,
    default_frame_delay_us: i64,
    start_wait: Duration,
    counters: VideoCounters,
}

impl VideoRenderLogic {
    fn new(context: &ComponentContext) -> Self {
        let config = &context.config.video_render;
        Self {
            frames: FrameQueue::new(
                VideoRender::IN_PORT,
                config.frame_nodes_initial,
                config.frame_nodes_step,
                config.frame_nodes_max,
            ),
            display_factory: context.backends.video_display.clone(),
            display: Mutex::new(None),
            state: Mutex::new(RenderState::default()),
            clock_running: AtomicBool::new(false),
            frame_end: AtomicBool::new(false),
            send_all: AtomicBool::new(false),
            eos_reported: AtomicBool::new(false),
            sync_tolerance_us: config.sync_tolerance_us,
            pts_jump_threshold_us: config.pts_jump_threshold_us,
            default_frame_delay_us: config.default_frame_delay_us,
            start_wait: Duration::from_millis(config.start_wait_ms.max(1)),
            counters: VideoCounters::default(),
        }
    }

    fn ensure_display(&self, base: &ComponentBase) -> Result<()> {
        let mut display = self.display.lock();
        if display.is_none() {
            let mut created = (self.display_factory)()?;
            created.init()?;
            tracing::debug!("[{}] Display initialised", base.name());
            *display = Some(created);
        }
        Ok(())
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
                "[{}] All frames handled ({} shown, {} dropped)",
                base.name(),
                self.counters.shown.load(Ordering::Relaxed),
                self.counters.dropped.load(Ordering::Relaxed)
            );
            base.notify(Event::BufferFlag {
                port: VideoRender::IN_PORT,
            });
        }
    }

    /// Current media time: the clock's while it runs, else the renderer's own.
    fn media_time(&self, base: &ComponentBase) -> (i64, TimeBase) {
        if self.clock_running.load(Ordering::Acquire) {
            if let Ok(Some((clock, clock_port))) = base.tunnel_peer(VideoRender::CLOCK_PORT) {
                let mut query = Config::CurrentMediaTime {
                    port: clock_port,
                    timestamp: -1,
                };
                if clock.get_config(&mut query).is_ok() {
                    if let Config::CurrentMediaTime { timestamp, .. } = query {
                        return (timestamp, TimeBase::Clock);
                    }
                }
            }
        }
        let own = self.state.lock().own_clock.media_time(base.now_us());
        (own, TimeBase::Own)
    }

    fn schedule(&self, delay: i64) -> Schedule {
        if delay > self.sync_tolerance_us {
            Schedule::Wait(delay)
        } else if delay > -self.sync_tolerance_us {
            Schedule::Show
        } else {
            Schedule::Drop
        }
    }

    /// First frame of a session. Returns `false` while the clock has yet to
    /// start.
    fn start(&self, base: &ComponentBase, pts: i64) -> Result<bool> {
        let phase = self.state.lock().phase;
        if phase == StartPhase::Pending {
            self.ensure_display(base)?;
            let mut next = StartPhase::Running;
            if let Some((clock, clock_port)) = base.tunnel_peer(VideoRender::CLOCK_PORT)? {
                let start = Config::ClientStartTime {
                    port: clock_port,
                    timestamp: pts,
                };
                match clock.set_config(&start) {
                    Ok(()) => next = StartPhase::WaitingForClock,
                    Err(e) => tracing::warn!(
                        "[{}] Clock refused start time {}, using own clock: {}",
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
        state.own_clock.anchor(pts, base.now_us());
        Ok(true)
    }

    fn show(&self, base: &ComponentBase, frame: &VideoFrame) -> Result<()> {
        let mut display = self.display.lock();
        let display = display
            .as_mut()
            .ok_or_else(|| PipelineError::Undefined("display not created".into()))?;
        display.render(frame)?;
        self.counters.shown.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("[{}] Showing frame {} at {}", base.name(), frame.id, frame.pts);
        Ok(())
    }

    /// Handle the head frame. `Ok(None)` means it was consumed.
    fn present(
        &self,
        base: &ComponentBase,
        id: NodeId,
        header: &BufferHeader,
    ) -> Result<Option<Step>> {
        let frame = VideoFrame::from_payload(&header.payload);
        let eos = header.flags.contains(BufferFlags::EOS);
        let blank = frame.is_none_or(|f| f.data.is_empty() && f.width == 0);

        // A bare end-of-stream marker has nothing to show.
        if eos && blank {
            self.frames.mark_rendered(id);
            return Ok(None);
        }
        let Some(frame) = frame else {
            return Err(PipelineError::BadParameter(format!(
                "buffer {} carries no video frame",
                header.id
            )));
        };

        let first = self.state.lock().phase != StartPhase::Running;
        if first {
            if !self.start(base, header.timestamp)? {
                return Ok(Some(Step::Wait(Some(self.start_wait))));
            }
            self.show(base, frame)?;
            self.replace_shown(id);
            base.notify(Event::VideoRenderFirstFrame);
            base.notify(Event::VideoRenderPts(header.timestamp));
            return Ok(None);
        }

        let now = base.now_us();
        let (media_time, time_base) = self.media_time(base);
        let mut delay = header.timestamp - media_time;
        // The reference clock is never re-anchored from here: a late frame
        // against it is dropped, an early one waited for.
        if time_base == TimeBase::Own && delay.abs() > self.pts_jump_threshold_us {
            tracing::debug!(
                "[{}] Timestamp jump of {} us at {}, re-anchoring",
                base.name(),
                delay,
                header.timestamp
            );
            self.counters.discontinuities.fetch_add(1, Ordering::Relaxed);
            self.state
                .lock()
                .own_clock
                .anchor(header.timestamp - self.default_frame_delay_us, now);
            delay = self.default_frame_delay_us;
        }

        match self.schedule(delay) {
            Schedule::Wait(delay) => {
                let wait = delay - self.sync_tolerance_us;
                Ok(Some(Step::Wait(Some(Duration::from_micros(
                    u64::try_from(wait.max(1)).unwrap_or(1),
                )))))
            }
            Schedule::Show => {
                self.show(base, frame)?;
                self.replace_shown(id);
                base.notify(Event::VideoRenderPts(header.timestamp));
                Ok(None)
            }
            Schedule::Drop => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "[{}] Dropping late frame {} ({} us late)",
                    base.name(),
                    frame.id,
                    -delay
                );
                self.frames.mark_rendered(id);
                Ok(None)
            }
        }
    }

    /// Make `id` the frame on screen; the previous one becomes returnable.
    fn replace_shown(&self, id: NodeId) {
        if self.frames.mark_rendered(id) {
            self.state.lock().shown = Some(id);
        }
    }

    fn release_all(&self, base: &ComponentBase) {
        self.state.lock().shown = None;
        self.frames.flush(base);
    }
}

impl ComponentLogic for VideoRenderLogic {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        match param {
            Parameter::FrameEnd(end) => {
                *end = self.frame_end.load(Ordering::Acquire);
                Ok(())
            }
            _ => base.get_port_parameter(param),
        }
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        match param {
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
            Config::VideoRenderInit => self.ensure_display(base).map_err(|e| {
                PipelineError::InsufficientResources(format!("display: {}", e))
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
                self.release_all(base);
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
        (port == VideoRender::IN_PORT).then(|| self.frames.counts())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let c = &self.counters;
        vec![
            ("received", self.frames.received.load(Ordering::Relaxed)),
            ("shown", c.shown.load(Ordering::Relaxed)),
            ("dropped", c.dropped.load(Ordering::Relaxed)),
            ("render_failed", c.render_failed.load(Ordering::Relaxed)),
            ("discontinuities", c.discontinuities.load(Ordering::Relaxed)),
            ("returned", self.frames.returned.load(Ordering::Relaxed)),
        ]
    }

    fn on_transition(
        &self,
        base: &ComponentBase,
        from: ComponentState,
        to: ComponentState,
    ) -> Result<()> {
        let now = base.now_us();
        match (from, to) {
            (ComponentState::Loaded, ComponentState::Idle) => self.reset_session(),
            (ComponentState::Executing, ComponentState::Pause) => {
                self.state.lock().own_clock.pause(now);
            }
            (ComponentState::Pause, _) => {
                self.state.lock().own_clock.resume(now);
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.release_all(base);
                self.display.lock().take();
                self.clock_running.store(false, Ordering::Release);
            }
            _ => {}
        }
        Ok(())
    }

    fn process(&self, base: &ComponentBase) -> Step {
        let shown = self.state.lock().shown;
        self.frames.return_rendered(base, shown, false);

        if self.send_all.load(Ordering::Acquire) {
            self.finish_stream(base);
            return Step::Wait(None);
        }

        let Some((id, header)) = self.frames.head() else {
            if self.frame_end.load(Ordering::Acquire) {
                self.finish_stream(base);
                return Step::Wait(None);
            }
            if self.frames.prepare_wait() {
                return Step::Continue;
            }
            return Step::Wait(None);
        };

        match self.present(base, id, &header) {
            Ok(Some(step)) => return step,
            Ok(None) => {}
            Err(e) => {
                self.counters.render_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Presenting frame {} failed: {}", base.name(), header.id, e);
                base.notify_error(ErrorCode::Undefined, VideoRender::IN_PORT);
                self.frames.mark_rendered(id);
            }
        }

        let shown = self.state.lock().shown;
        self.frames.return_rendered(base, shown, false);
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

    use super::*;
    use crate::core::{Backends, ManualTimeSource, PipelineConfig};

    fn logic() -> VideoRenderLogic {
        let context = ComponentContext {
            name: "video-render-test".into(),
            config: Arc::new(PipelineConfig::default()),
            backends: Arc::new(Backends::default()),
            time: Arc::new(ManualTimeSource::new(0)),
        };
        VideoRenderLogic::new(&context)
    }

    #[test]
    fn test_schedule_windows() {
        let logic = logic();
        assert_eq!(logic.schedule(50_000), Schedule::Wait(50_000));
        assert_eq!(logic.schedule(10_000), Schedule::Show);
        assert_eq!(logic.schedule(0), Schedule::Show);
        assert_eq!(logic.schedule(-9_999), Schedule::Show);
        assert_eq!(logic.schedule(-10_000), Schedule::Drop);
    }

    #[test]
    fn test_own_clock_excludes_pauses() {
        let mut clock = OwnClock::default();
        clock.anchor(1_000, 100);
        assert_eq!(clock.media_time(600), 1_500);
        clock.pause(600);
        assert_eq!(clock.media_time(5_000), 1_500);
        clock.resume(5_000);
        assert_eq!(clock.media_time(5_100), 1_600);
    }
}
