// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::state::ComponentState;

/// Commands understood by every component's worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    StateSet(ComponentState),
    Flush(u32),
    PortDisable(u32),
    PortEnable(u32),
    MarkBuffer(u32),
    /// Leave the worker loop. Sent by `deinit`.
    Stop,
    /// Wake the worker; something may have changed since it last looked.
    Nop,
}

impl Command {
    /// Port index for port-scoped commands.
    pub fn port(&self) -> Option<u32> {
        match self {
            Self::Flush(p) | Self::PortDisable(p) | Self::PortEnable(p) | Self::MarkBuffer(p) => {
                Some(*p)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub payload: Option<Bytes>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn with_payload(command: Command, payload: Bytes) -> Self {
        Self {
            command,
            payload: Some(payload),
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}
