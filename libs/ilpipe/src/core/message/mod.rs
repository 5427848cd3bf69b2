// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod command;
mod queue;

pub use command::{Command, Message};
pub use queue::MessageQueue;
