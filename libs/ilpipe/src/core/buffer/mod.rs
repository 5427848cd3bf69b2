// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod frame;
mod header;
mod node_lists;

pub use frame::{AudioFrame, DecodedFrame, PixelFormat, VideoFrame};
pub use header::{BufferFlags, BufferHeader, BufferId, BufferPayload};
pub use node_lists::{BufferCounts, ListKind, Lists, NodeId, NodeLists};
