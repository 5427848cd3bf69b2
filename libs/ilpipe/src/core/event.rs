// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Asynchronous notifications delivered through
//! [`ComponentCallbacks::event_handler`](super::callbacks::ComponentCallbacks::event_handler).

use serde::{Deserialize, Serialize};

use super::message::Command;

/// Error sub-code carried by [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InsufficientResources,
    Undefined,
    ComponentNotFound,
    BadParameter,
    NotImplemented,
    Overflow,
    InvalidState,
    SameState,
    IncorrectStateTransition,
    IncorrectStateOperation,
    PortsNotCompatible,
    BadPortIndex,
    FormatNotDetected,
    UnsupportedIndex,
    /// The codec engine hit an unrecoverable bitstream error.
    MbErrorsInFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A queued command finished. For state changes this carries the new state.
    CmdComplete(Command),
    /// A command or data-plane step failed on the worker thread.
    ///
    /// `data` is the component state at the time of a failed transition, or a
    /// port index for port-scoped failures; zero otherwise.
    Error { code: ErrorCode, data: u32 },
    /// End of stream fully drained on `port`. Raised once per Executing session.
    BufferFlag { port: u32 },
    /// The demuxer opened the content and found at least one usable stream.
    PortFormatDetected,
    /// Presentation time of the frame just shown, in microseconds.
    VideoRenderPts(i64),
    /// Real audio time (timestamp minus device latency) of the frame just queued.
    AudioRenderPts(i64),
    VideoRenderFirstFrame,
    AudioRenderFirstFrame,
    /// The muxer is about to open its next file. A handler may set a new
    /// `ContentUri` before returning; otherwise the current one is reused.
    MuxerNeedNextFile,
}

impl Event {
    pub fn error(code: ErrorCode, data: u32) -> Self {
        Self::Error { code, data }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
