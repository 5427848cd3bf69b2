// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Parameter and config indices.
//!
//! `get_*` calls take the value by `&mut` and fill it in place, so the caller
//! names the index (and port) by the variant it passes.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::buffer::PixelFormat;
use super::port::{BufferSupplier, PortDefinition};
use super::state::ClockState;

/// Compression format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Coding {
    #[default]
    Unused,
    H264,
    Mjpeg,
    Mp3,
    Aac,
    Pcm,
}

impl Coding {
    pub fn is_video(self) -> bool {
        matches!(self, Self::H264 | Self::Mjpeg)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac | Self::Pcm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoPortFormat {
    pub port: u32,
    pub coding: Coding,
    pub color_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioPortFormat {
    pub port: u32,
    pub coding: Coding,
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
}

/// Container a recording is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContainerFormat {
    #[default]
    Mp4,
    MpegTs,
}

/// How a recording is split into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderFileInfo {
    /// A file is closed once every recorded track spans more than this,
    /// microseconds. Zero or less never splits.
    pub duration_us: i64,
    /// Files the application intends to cycle through.
    pub file_count: u32,
    pub container: ContainerFormat,
}

bitflags! {
    /// Tracks the demuxer should read past instead of delivering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SkipTrack: u32 {
        const VIDEO = 1 << 0;
        const AUDIO = 1 << 1;
    }
}

bitflags! {
    /// Clock ports that still owe a start time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClockPorts: u32 {
        const PORT0 = 1 << 0;
        const PORT1 = 1 << 1;
        const PORT2 = 1 << 2;
    }
}

impl ClockPorts {
    /// Bit for a clock port index, if the clock has one.
    pub fn for_port(port: u32) -> Option<Self> {
        match port {
            0 => Some(Self::PORT0),
            1 => Some(Self::PORT1),
            2 => Some(Self::PORT2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    PortDefinition(PortDefinition),
    BufferSupplier {
        port: u32,
        supplier: BufferSupplier,
    },
    /// Number of ports and index of the first one.
    PortParam {
        ports: u32,
        start_port: u32,
    },
    NumAvailableStreams {
        port: u32,
        streams: u32,
    },
    ActiveStream {
        port: u32,
        stream: u32,
    },
    VideoPortFormat(VideoPortFormat),
    AudioPortFormat(AudioPortFormat),
    ContentUri(String),
    SkipTrack(SkipTrack),
    /// Output volume, 0..=100.
    AudioVolume(u32),
    /// Upstream will not deliver more frames.
    FrameEnd(bool),
    RecorderFileInfo(RecorderFileInfo),
    /// Encoder quality, 1..=100.
    QFactor(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeekMode {
    #[default]
    Fast,
    Accurate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockStateConfig {
    pub state: ClockState,
    pub wait_mask: ClockPorts,
    pub start_time: i64,
}

impl ClockStateConfig {
    pub fn waiting_for(wait_mask: ClockPorts) -> Self {
        Self {
            state: ClockState::WaitingForStartTime,
            wait_mask,
            start_time: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Config {
    /// Seek / reposition, microseconds.
    TimePosition(i64),
    SeekMode(SeekMode),
    ClockState(ClockStateConfig),
    ClientStartTime { port: u32, timestamp: i64 },
    CurrentMediaTime { port: u32, timestamp: i64 },
    CurrentAudioReference { port: u32, timestamp: i64 },
    CurrentVideoReference { port: u32, timestamp: i64 },
    /// Move every queued-but-undelivered buffer back to `empty`.
    ClearBuffer,
    AudioRenderInit,
    VideoRenderInit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_port_bits() {
        assert_eq!(ClockPorts::for_port(0), Some(ClockPorts::PORT0));
        assert_eq!(ClockPorts::for_port(2).map(|p| p.bits()), Some(0x4));
        assert_eq!(ClockPorts::for_port(3), None);
    }

    #[test]
    fn test_coding_domains() {
        assert!(Coding::H264.is_video());
        assert!(Coding::Aac.is_audio());
        assert!(!Coding::Unused.is_video() && !Coding::Unused.is_audio());
    }
}
