// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use bytes::Bytes;

use super::frame::{AudioFrame, VideoFrame};

bitflags! {
    /// Per-buffer flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Last unit of the stream.
        const EOS = 1 << 0;
        /// Out-of-band codec initialisation data, queued ahead of real packets.
        const EXTRA_DATA = 1 << 1;
        const KEY_FRAME = 1 << 2;
    }
}

/// Identity of a buffer node, used to match returned buffers against the
/// `processing` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl BufferId {
    /// Allocate a process-unique id for a new packet node.
    pub fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an id assigned elsewhere, e.g. a codec engine's frame id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a [`BufferHeader`] carries across a component boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BufferPayload {
    #[default]
    Empty,
    Packet(Bytes),
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl BufferPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Packet(data) => data.len(),
            Self::Video(frame) => frame.data.len(),
            Self::Audio(frame) => frame.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The unit handed to `empty_this_buffer` / `fill_this_buffer` and to the
/// buffer-done callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferHeader {
    pub id: BufferId,
    pub payload: BufferPayload,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub output_port: u32,
    pub input_port: u32,
}

impl BufferHeader {
    pub fn new(id: BufferId, payload: BufferPayload) -> Self {
        Self {
            id,
            payload,
            timestamp: 0,
            flags: BufferFlags::empty(),
            output_port: 0,
            input_port: 0,
        }
    }

    pub fn packet(id: BufferId, data: Bytes, timestamp: i64, flags: BufferFlags) -> Self {
        Self {
            timestamp,
            flags,
            ..Self::new(id, BufferPayload::Packet(data))
        }
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_ids_are_unique() {
        let a = BufferId::next();
        let b = BufferId::next();
        assert_ne!(a, b);
        assert_eq!(BufferId::from_raw(7).raw(), 7);
    }

    #[test]
    fn test_packet_header() {
        let header = BufferHeader::packet(
            BufferId::from_raw(3),
            Bytes::from_static(&[1, 2, 3]),
            40_000,
            BufferFlags::EOS | BufferFlags::KEY_FRAME,
        );
        assert!(header.is_eos());
        assert_eq!(header.payload.len(), 3);
        assert_eq!(header.timestamp, 40_000);
    }
}
