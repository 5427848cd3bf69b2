// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Reference clock.
//!
//! Keeps the shared media time base. Renderers tunneled to its ports report
//! the timestamp they want to start at; once every armed port has reported,
//! the clock starts running and tells both peers. Media time is
//! `(now - wall_base - pause_duration) + start_time`, in microseconds.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{
    ClockPorts, ClockState, ClockStateConfig, ComponentBase, ComponentContext, ComponentHandle,
    ComponentHost, ComponentLogic, ComponentState, Config, PipelineError, Port, PortDomain,
    Result,
};

/// Reference clock component.
pub struct Clock;

impl Clock {
    /// Clock output tunneled to the video renderer.
    pub const VIDEO_PORT: u32 = 0;
    /// Clock output tunneled to the audio renderer.
    pub const AUDIO_PORT: u32 = 1;

    const PORT_COUNT: usize = 2;

    pub fn create(context: &ComponentContext) -> Result<ComponentHandle> {
        let base = ComponentBase::new(
            context,
            vec![
                Port::output(Self::VIDEO_PORT, PortDomain::Other),
                Port::output(Self::AUDIO_PORT, PortDomain::Other),
            ],
        );
        let logic = ClockLogic::new(context.config.clock.drift_tolerance_us);
        ComponentHost::spawn_handle(base, logic)
    }
}

inventory::submit! {
    crate::core::ComponentRegistration::new(super::names::CLOCK, Clock::create)
}

#[derive(Debug, Clone)]
struct TimeBase {
    state: ClockState,
    wait_mask: ClockPorts,
    /// Mask as it was when the clock last started waiting.
    armed_mask: ClockPorts,
    port_start_times: [i64; Clock::PORT_COUNT],
    start_time: i64,
    wall_base: i64,
    pause_duration: i64,
    paused_at: Option<i64>,
}

impl Default for TimeBase {
    fn default() -> Self {
        Self {
            state: ClockState::Stopped,
            wait_mask: ClockPorts::empty(),
            armed_mask: ClockPorts::empty(),
            port_start_times: [-1; Clock::PORT_COUNT],
            start_time: -1,
            wall_base: 0,
            pause_duration: 0,
            paused_at: None,
        }
    }
}

impl TimeBase {
    fn media_time(&self, now: i64) -> i64 {
        // Frozen while paused.
        let now = self.paused_at.unwrap_or(now);
        now - self.wall_base - self.pause_duration + self.start_time
    }

    fn arm(&mut self, mask: ClockPorts) {
        self.state = ClockState::WaitingForStartTime;
        self.wait_mask = mask;
        self.armed_mask = mask;
        self.port_start_times = [-1; Clock::PORT_COUNT];
    }

    fn anchor(&mut self, start_time: i64, now: i64) {
        self.start_time = start_time;
        self.wall_base = now;
        self.pause_duration = 0;
        self.paused_at = None;
    }

    /// Reference start time once every armed port has reported: the audio
    /// port's when audio was armed, else the earliest reported time.
    fn reference_start(&self) -> i64 {
        let audio = self.port_start_times[Clock::AUDIO_PORT as usize];
        if self.armed_mask.contains(ClockPorts::PORT1) && audio >= 0 {
            return audio;
        }
        self.port_start_times
            .iter()
            .copied()
            .filter(|t| *t >= 0)
            .min()
            .unwrap_or(0)
    }
}

struct ClockLogic {
    time_base: Mutex<TimeBase>,
    drift_tolerance_us: i64,
    starts: AtomicU64,
    corrections: AtomicU64,
    ignored_corrections: AtomicU64,
}

impl ClockLogic {
    fn new(drift_tolerance_us: i64) -> Self {
        Self {
            time_base: Mutex::new(TimeBase::default()),
            drift_tolerance_us,
            starts: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            ignored_corrections: AtomicU64::new(0),
        }
    }

    /// Tell both tunneled peers the clock is running. Called without the
    /// time-base lock held: a peer may call straight back into the clock.
    fn notify_peers_running(&self, base: &ComponentBase, start_time: i64) {
        let running = Config::ClockState(ClockStateConfig {
            state: ClockState::Running,
            wait_mask: ClockPorts::empty(),
            start_time,
        });
        for port in [Clock::VIDEO_PORT, Clock::AUDIO_PORT] {
            match base.tunnel_peer(port) {
                Ok(Some((peer, _))) => {
                    if let Err(e) = peer.set_config(&running) {
                        tracing::warn!(
                            "[{}] {} did not take the running state: {}",
                            base.name(),
                            peer.name(),
                            e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("[{}] Port {}: {}", base.name(), port, e),
            }
        }
    }

    fn set_clock_state(&self, base: &ComponentBase, requested: &ClockStateConfig) -> Result<()> {
        let started = {
            let mut time_base = self.time_base.lock();
            if requested.state != ClockState::Stopped && time_base.state != ClockState::Stopped {
                return Err(PipelineError::Undefined(format!(
                    "clock is {}, state can only change while stopped",
                    time_base.state
                )));
            }
            match requested.state {
                ClockState::Stopped => {
                    *time_base = TimeBase::default();
                    None
                }
                ClockState::WaitingForStartTime => {
                    time_base.arm(requested.wait_mask);
                    None
                }
                ClockState::Running => {
                    time_base.anchor(requested.start_time, base.now_us());
                    time_base.state = ClockState::Running;
                    Some(requested.start_time)
                }
            }
        };

        tracing::debug!("[{}] Clock state set to {}", base.name(), requested.state);
        if let Some(start_time) = started {
            self.starts.fetch_add(1, Ordering::Relaxed);
            self.notify_peers_running(base, start_time);
        }
        Ok(())
    }

    fn client_start_time(&self, base: &ComponentBase, port: u32, timestamp: i64) -> Result<()> {
        let started = {
            let mut time_base = self.time_base.lock();
            if time_base.state != ClockState::WaitingForStartTime {
                return Err(PipelineError::Undefined(format!(
                    "clock is {}, not waiting for start times",
                    time_base.state
                )));
            }
            let bit = ClockPorts::for_port(port)
                .filter(|_| (port as usize) < Clock::PORT_COUNT)
                .ok_or(PipelineError::BadPortIndex(port))?;

            time_base.port_start_times[port as usize] = timestamp;
            time_base.wait_mask.remove(bit);
            tracing::debug!(
                "[{}] Port {} reported start time {}, still waiting for {:?}",
                base.name(),
                port,
                timestamp,
                time_base.wait_mask
            );

            if time_base.wait_mask.is_empty() {
                let start_time = time_base.reference_start();
                time_base.anchor(start_time, base.now_us());
                time_base.state = ClockState::Running;
                Some(start_time)
            } else {
                None
            }
        };

        if let Some(start_time) = started {
            tracing::info!("[{}] Running from media time {}", base.name(), start_time);
            self.starts.fetch_add(1, Ordering::Relaxed);
            self.notify_peers_running(base, start_time);
        }
        Ok(())
    }

    fn correct(&self, base: &ComponentBase, timestamp: i64) -> Result<()> {
        let mut time_base = self.time_base.lock();
        if time_base.state != ClockState::Running {
            return Err(PipelineError::Undefined(format!(
                "clock is {}, corrections need Running",
                time_base.state
            )));
        }
        let now = base.now_us();
        let media_time = time_base.media_time(now);
        let drift = media_time - timestamp;
        if drift.abs() > self.drift_tolerance_us {
            tracing::debug!(
                "[{}] Re-anchoring to {} (media time {}, drift {})",
                base.name(),
                timestamp,
                media_time,
                drift
            );
            let paused_at = time_base.paused_at;
            time_base.anchor(timestamp, now);
            // Keep a paused clock paused, frozen at the new anchor.
            time_base.paused_at = paused_at.map(|_| now);
            self.corrections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ignored_corrections.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl ComponentLogic for ClockLogic {
    fn get_config(&self, base: &ComponentBase, config: &mut Config) -> Result<()> {
        let time_base = self.time_base.lock();
        match config {
            Config::CurrentMediaTime { timestamp, .. } => {
                if time_base.state != ClockState::Running {
                    *timestamp = -1;
                    return Err(PipelineError::Undefined(format!(
                        "clock is {}, media time needs Running",
                        time_base.state
                    )));
                }
                *timestamp = time_base.media_time(base.now_us());
                Ok(())
            }
            Config::ClockState(current) => {
                *current = ClockStateConfig {
                    state: time_base.state,
                    wait_mask: time_base.wait_mask,
                    start_time: time_base.start_time,
                };
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
            Config::ClockState(requested) => self.set_clock_state(base, requested),
            Config::ClientStartTime { port, timestamp } => {
                self.client_start_time(base, *port, *timestamp)
            }
            Config::CurrentAudioReference { timestamp, .. }
            | Config::CurrentVideoReference { timestamp, .. } => self.correct(base, *timestamp),
            Config::TimePosition(position) => {
                let mut time_base = self.time_base.lock();
                let mask = if time_base.armed_mask.is_empty() {
                    ClockPorts::PORT0 | ClockPorts::PORT1
                } else {
                    time_base.armed_mask
                };
                time_base.arm(mask);
                tracing::debug!(
                    "[{}] Repositioned to {}, waiting for {:?}",
                    base.name(),
                    position,
                    mask
                );
                Ok(())
            }
            Config::SeekMode(_) => Ok(()),
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} cannot set config {:?}",
                base.name(),
                other
            ))),
        }
    }

    fn on_transition(
        &self,
        base: &ComponentBase,
        from: ComponentState,
        to: ComponentState,
    ) -> Result<()> {
        let now = base.now_us();
        let mut time_base = self.time_base.lock();
        match (from, to) {
            (ComponentState::Executing, ComponentState::Pause) => {
                time_base.paused_at = Some(now);
            }
            (ComponentState::Pause, _) => {
                if let Some(paused_at) = time_base.paused_at.take() {
                    time_base.pause_duration += now - paused_at;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("starts", self.starts.load(Ordering::Relaxed)),
            ("corrections", self.corrections.load(Ordering::Relaxed)),
            (
                "ignored_corrections",
                self.ignored_corrections.load(Ordering::Relaxed),
            ),
        ]
    }

    fn on_exit(&self, base: &ComponentBase) {
        let counters = self.counters();
        tracing::debug!("[{}] Exit counters: {:?}", base.name(), counters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_time_formula() {
        let mut time_base = TimeBase::default();
        time_base.anchor(1_000, 50_000);
        time_base.state = ClockState::Running;
        assert_eq!(time_base.media_time(50_500), 1_500);
    }

    #[test]
    fn test_media_time_frozen_while_paused() {
        let mut time_base = TimeBase::default();
        time_base.anchor(0, 0);
        time_base.paused_at = Some(100);
        assert_eq!(time_base.media_time(900), 100);
        time_base.pause_duration += 900 - 100;
        time_base.paused_at = None;
        assert_eq!(time_base.media_time(1_000), 200);
    }

    #[test]
    fn test_reference_prefers_audio_port() {
        let mut time_base = TimeBase::default();
        time_base.arm(ClockPorts::PORT0 | ClockPorts::PORT1);
        time_base.port_start_times = [100, 400];
        assert_eq!(time_base.reference_start(), 400);

        time_base.arm(ClockPorts::PORT0);
        time_base.port_start_times = [250, -1];
        assert_eq!(time_base.reference_start(), 250);
    }
}
