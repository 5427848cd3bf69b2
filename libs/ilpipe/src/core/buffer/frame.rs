// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Decoded frame descriptors.
//!
//! Frames are plain data. Which component owns one is decided by the list its
//! node sits in, never by the descriptor itself.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::header::{BufferFlags, BufferPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Yuv420p,
    Nv12,
    Nv21,
    Rgb565,
    Argb8888,
}

/// A decoded picture as produced by a hardware codec: plane addresses,
/// dma-buf descriptors and strides, plus an optional CPU-visible copy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoFrame {
    /// Engine-assigned frame identity, stable while the frame is lent out.
    pub id: u64,
    pub pts: i64,
    pub flags: BufferFlags,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: [u32; 3],
    pub phy_addr: [u64; 3],
    pub fd: [i32; 3],
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioFrame {
    pub id: u64,
    pub pts: i64,
    pub flags: BufferFlags,
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub data: Bytes,
}

/// Common surface of the frame types a decoder can emit.
pub trait DecodedFrame: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn frame_id(&self) -> u64;
    fn pts(&self) -> i64;
    fn flags(&self) -> BufferFlags;
    fn into_payload(self) -> BufferPayload;
    fn from_payload(payload: &BufferPayload) -> Option<&Self>;
}

impl DecodedFrame for VideoFrame {
    fn frame_id(&self) -> u64 {
        self.id
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn into_payload(self) -> BufferPayload {
        BufferPayload::Video(self)
    }

    fn from_payload(payload: &BufferPayload) -> Option<&Self> {
        match payload {
            BufferPayload::Video(frame) => Some(frame),
            _ => None,
        }
    }
}

impl DecodedFrame for AudioFrame {
    fn frame_id(&self) -> u64 {
        self.id
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn into_payload(self) -> BufferPayload {
        BufferPayload::Audio(self)
    }

    fn from_payload(payload: &BufferPayload) -> Option<&Self> {
        match payload {
            BufferPayload::Audio(frame) => Some(frame),
            _ => None,
        }
    }
}
