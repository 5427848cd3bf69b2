// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Container parser boundary: an opaque packet source with
//! peek / read / seek / end-of-stream semantics.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::core::buffer::BufferFlags;
use crate::core::error::{PipelineError, Result};
use crate::core::params::Coding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    /// Subtitles, data tracks and anything else the pipeline does not play.
    Other,
}

/// Header of the next packet, as reported by [`MediaParser::peek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub kind: StreamKind,
    pub size: usize,
    pub pts: i64,
    pub flags: BufferFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// No more packets. Sticky until the next seek.
    Eos,
    Failed(String),
}

pub type ParseResult<T> = std::result::Result<T, ParseStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoStreamInfo {
    pub coding: Coding,
    pub width: u32,
    pub height: u32,
    /// Out-of-band codec initialisation data (e.g. SPS/PPS).
    pub extra_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioStreamInfo {
    pub coding: Coding,
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub extra_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaInfo {
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub duration_us: i64,
}

pub trait MediaParser: Send {
    fn media_info(&mut self) -> Result<MediaInfo>;

    /// Describe the next packet without consuming it.
    fn peek(&mut self) -> ParseResult<PacketInfo>;

    /// Consume the next packet, replacing the contents of `buf` with it.
    fn read(&mut self, buf: &mut Vec<u8>) -> ParseResult<PacketInfo>;

    /// Reposition to `time_us`. Clears end of stream.
    fn seek(&mut self, time_us: i64) -> Result<()>;
}

pub trait ParserFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn MediaParser>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPacket {
    pub kind: StreamKind,
    pub pts: i64,
    pub flags: BufferFlags,
    pub data: Bytes,
}

impl MemoryPacket {
    pub fn video(pts: i64, data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Video,
            pts,
            flags: BufferFlags::empty(),
            data: data.into(),
        }
    }

    pub fn audio(pts: i64, data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Audio,
            pts,
            flags: BufferFlags::empty(),
            data: data.into(),
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A fully parsed stream held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedia {
    pub info: MediaInfo,
    pub packets: Vec<MemoryPacket>,
}

/// Parser over a [`MemoryMedia`].
pub struct MemoryParser {
    media: MemoryMedia,
    cursor: usize,
}

impl MemoryParser {
    pub fn new(media: MemoryMedia) -> Self {
        Self { media, cursor: 0 }
    }

    fn current(&self) -> ParseResult<&MemoryPacket> {
        self.media.packets.get(self.cursor).ok_or(ParseStatus::Eos)
    }
}

impl MediaParser for MemoryParser {
    fn media_info(&mut self) -> Result<MediaInfo> {
        Ok(self.media.info.clone())
    }

    fn peek(&mut self) -> ParseResult<PacketInfo> {
        let packet = self.current()?;
        Ok(PacketInfo {
            kind: packet.kind,
            size: packet.data.len(),
            pts: packet.pts,
            flags: packet.flags,
        })
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> ParseResult<PacketInfo> {
        let packet = self.current()?;
        let info = PacketInfo {
            kind: packet.kind,
            size: packet.data.len(),
            pts: packet.pts,
            flags: packet.flags,
        };
        buf.clear();
        buf.extend_from_slice(&packet.data);
        self.cursor += 1;
        Ok(info)
    }

    fn seek(&mut self, time_us: i64) -> Result<()> {
        if time_us < 0 {
            return Err(PipelineError::BadParameter(format!(
                "seek to negative time {}",
                time_us
            )));
        }
        self.cursor = self
            .media
            .packets
            .iter()
            .position(|p| p.pts >= time_us)
            .unwrap_or(self.media.packets.len());
        Ok(())
    }
}

/// Resolves `mem://<name>` URIs against media registered with
/// [`MemoryParserFactory::register`].
#[derive(Default, Clone)]
pub struct MemoryParserFactory {
    media: Arc<RwLock<HashMap<String, MemoryMedia>>>,
}

impl MemoryParserFactory {
    pub const SCHEME: &'static str = "mem://";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register `media` and return the URI that opens it.
    pub fn register(&self, name: &str, media: MemoryMedia) -> String {
        self.media.write().insert(name.to_string(), media);
        format!("{}{}", Self::SCHEME, name)
    }
}

impl ParserFactory for MemoryParserFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn MediaParser>> {
        let name = uri.strip_prefix(Self::SCHEME).ok_or_else(|| {
            PipelineError::BadParameter(format!("unsupported content uri {}", uri))
        })?;
        let media = self.media.read().get(name).cloned().ok_or_else(|| {
            PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no media registered as {}", name),
            ))
        })?;
        Ok(Box::new(MemoryParser::new(media)))
    }
}
