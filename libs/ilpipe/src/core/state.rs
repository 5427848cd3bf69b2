// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

use super::error::{PipelineError, Result};

/// Lifecycle state of a component instance.
///
/// Written only by the component's own worker thread, read by anyone through
/// [`Component::get_state`](super::component::Component::get_state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Constructed, ports may be tunneled, no heavy resources held
    Loaded,
    /// Resources (codec, device, parser) allocated, data plane stopped
    Idle,
    /// Data plane running
    Executing,
    /// Data plane suspended, resources kept
    Pause,
    /// Terminal; the handle must be destroyed
    Invalid,
}

impl Default for ComponentState {
    fn default() -> Self {
        Self::Loaded
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded => write!(f, "Loaded"),
            Self::Idle => write!(f, "Idle"),
            Self::Executing => write!(f, "Executing"),
            Self::Pause => write!(f, "Pause"),
            Self::Invalid => write!(f, "Invalid"),
        }
    }
}

impl ComponentState {
    /// Numeric form used in the `data` field of error events.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::Loaded => 1,
            Self::Idle => 2,
            Self::Executing => 3,
            Self::Pause => 4,
        }
    }

    /// Check whether `self -> to` is a legal transition.
    ///
    /// Requesting the current state is `SameState`. Invalid is reachable from
    /// everywhere and left from nowhere. Loaded is only reachable from Idle and
    /// Executing is never reachable directly from Loaded.
    pub fn check_transition(self, to: ComponentState) -> Result<()> {
        use ComponentState::*;

        if self == to {
            return Err(PipelineError::SameState(to));
        }

        let allowed = match (self, to) {
            (_, Invalid) => true,
            (Invalid, _) => false,
            (Loaded | Executing | Pause, Idle) => true,
            (Idle | Pause, Executing) => true,
            (Idle | Executing, Pause) => true,
            (Idle, Loaded) => true,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(PipelineError::IncorrectStateTransition { from: self, to })
        }
    }
}

/// Time-base state of the reference clock, independent of its component state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockState {
    Stopped,
    /// Waiting for every armed port to report a start time
    WaitingForStartTime,
    Running,
}

impl Default for ClockState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for ClockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::WaitingForStartTime => write!(f, "WaitingForStartTime"),
            Self::Running => write!(f, "Running"),
        }
    }
}
