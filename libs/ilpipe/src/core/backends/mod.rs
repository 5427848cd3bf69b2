// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! External collaborators: parser, codec engines, audio device, display,
//! and on the recording side the encoder and the container writer.
//!
//! The pipeline only talks to these through the traits below. The in-crate
//! implementations are software stand-ins (memory parser, passthrough
//! engines, null outputs, in-memory muxer).

mod audio;
mod codec;
mod display;
mod encoder;
mod muxer;
mod parser;

use std::sync::Arc;

pub use audio::{AudioAttr, AudioDevice, NullAudioDevice, NullAudioStats};
pub use codec::{
    DecodeStatus, DecoderEngine, DecoderPacket, EngineConfig, EngineFactory, PassthroughEngine,
    PassthroughEngineFactory,
};
pub use display::{NullDisplayStats, NullVideoDisplay, VideoDisplay};
pub use encoder::{
    EncodedPacket, EncoderEngine, EncoderFactory, EncoderSettings, PassthroughEncoder,
    PassthroughEncoderFactory,
};
pub use muxer::{
    MemoryMuxer, MemoryMuxerFactory, MuxerFactory, MuxerPacket, MuxerStreams, MuxerWriter,
    RecordedFile, RecordedPacket, WriteStatus,
};
pub use parser::{
    AudioStreamInfo, MediaInfo, MediaParser, MemoryMedia, MemoryPacket, MemoryParser,
    MemoryParserFactory, PacketInfo, ParseResult, ParseStatus, ParserFactory, StreamKind,
    VideoStreamInfo,
};

use super::buffer::{AudioFrame, VideoFrame};
use super::error::Result;

pub type AudioDeviceFactory = Arc<dyn Fn() -> Result<Box<dyn AudioDevice>> + Send + Sync>;
pub type VideoDisplayFactory = Arc<dyn Fn() -> Result<Box<dyn VideoDisplay>> + Send + Sync>;

/// Everything components need from outside the pipeline.
#[derive(Clone)]
pub struct Backends {
    pub parsers: Arc<dyn ParserFactory>,
    pub video_engines: Arc<dyn EngineFactory<VideoFrame>>,
    pub audio_engines: Arc<dyn EngineFactory<AudioFrame>>,
    pub audio_device: AudioDeviceFactory,
    pub video_display: VideoDisplayFactory,
    pub video_encoders: Arc<dyn EncoderFactory>,
    pub muxers: Arc<dyn MuxerFactory>,
}

impl Backends {
    pub fn with_parsers(mut self, parsers: Arc<dyn ParserFactory>) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn with_audio_stats(mut self, stats: Arc<NullAudioStats>) -> Self {
        self.audio_device = Arc::new(move || {
            Ok(Box::new(NullAudioDevice::new(Arc::clone(&stats))) as Box<dyn AudioDevice>)
        });
        self
    }

    pub fn with_display_stats(mut self, stats: Arc<NullDisplayStats>) -> Self {
        self.video_display = Arc::new(move || {
            Ok(Box::new(NullVideoDisplay::new(Arc::clone(&stats))) as Box<dyn VideoDisplay>)
        });
        self
    }

    pub fn with_audio_device(mut self, factory: AudioDeviceFactory) -> Self {
        self.audio_device = factory;
        self
    }

    pub fn with_video_display(mut self, factory: VideoDisplayFactory) -> Self {
        self.video_display = factory;
        self
    }

    pub fn with_video_encoders(mut self, encoders: Arc<dyn EncoderFactory>) -> Self {
        self.video_encoders = encoders;
        self
    }

    pub fn with_muxers(mut self, muxers: Arc<dyn MuxerFactory>) -> Self {
        self.muxers = muxers;
        self
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            parsers: Arc::new(MemoryParserFactory::new()),
            video_engines: Arc::new(PassthroughEngineFactory),
            audio_engines: Arc::new(PassthroughEngineFactory),
            audio_device: Arc::new(|| {
                Ok(Box::new(NullAudioDevice::new(Arc::default())) as Box<dyn AudioDevice>)
            }),
            video_display: Arc::new(|| {
                Ok(Box::new(NullVideoDisplay::new(Arc::default())) as Box<dyn VideoDisplay>)
            }),
            video_encoders: Arc::new(PassthroughEncoderFactory),
            muxers: Arc::new(MemoryMuxerFactory::new()),
        }
    }
}
