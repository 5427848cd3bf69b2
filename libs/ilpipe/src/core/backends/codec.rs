// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Codec engine boundary: packets in, frames out, fixed status codes.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;

use crate::core::buffer::{AudioFrame, BufferFlags, DecodedFrame, VideoFrame};
use crate::core::error::{PipelineError, Result};
use crate::core::params::{AudioPortFormat, Coding, VideoPortFormat};

/// Result of one [`DecoderEngine::decode`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// Nothing to decode until more packets arrive.
    NoReadyPacket,
    /// Every frame is lent out; one must be returned first.
    NoEmptyFrame,
    NoRenderFrame,
    /// Unrecoverable bitstream or hardware error.
    Fatal(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderPacket<'a> {
    pub data: &'a [u8],
    pub pts: i64,
    pub flags: BufferFlags,
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub coding: Coding,
    pub packet_buffer_size: usize,
    pub packet_count: usize,
    pub frame_count: usize,
    pub video: VideoPortFormat,
    pub audio: AudioPortFormat,
}

pub trait DecoderEngine: Send {
    type Frame: DecodedFrame;

    fn init(&mut self, config: &EngineConfig) -> Result<()>;

    /// Queue a compressed packet. `Overflow` when the engine's packet slots
    /// are all in use.
    fn put_packet(&mut self, packet: DecoderPacket<'_>) -> Result<()>;

    fn decode(&mut self) -> DecodeStatus;

    /// Take the next decoded frame. The frame stays lent until
    /// [`put_frame`](Self::put_frame).
    fn get_frame(&mut self) -> Option<Self::Frame>;

    fn put_frame(&mut self, frame: &Self::Frame) -> Result<()>;

    /// Drop queued packets and reclaim every frame.
    fn reset(&mut self) -> Result<()>;
}

pub trait EngineFactory<F: DecodedFrame>: Send + Sync {
    fn create(&self, coding: Coding) -> Result<Box<dyn DecoderEngine<Frame = F>>>;
}

#[derive(Debug, Clone)]
struct PendingPacket {
    data: Bytes,
    pts: i64,
    flags: BufferFlags,
}

/// Software engine that turns every packet into one frame carrying the packet
/// bytes. Extra-data packets are consumed without producing a frame.
pub struct PassthroughEngine<F> {
    config: Option<EngineConfig>,
    packets: VecDeque<PendingPacket>,
    free_frames: VecDeque<u64>,
    decoded: VecDeque<F>,
    lent: HashSet<u64>,
    make: fn(u64, &PendingPacket, &EngineConfig) -> F,
}

fn make_video_frame(id: u64, packet: &PendingPacket, config: &EngineConfig) -> VideoFrame {
    let width = config.video.width;
    VideoFrame {
        id,
        pts: packet.pts,
        flags: packet.flags - BufferFlags::EXTRA_DATA,
        width,
        height: config.video.height,
        format: config.video.color_format,
        stride: [width, width / 2, width / 2],
        phy_addr: [0; 3],
        fd: [-1; 3],
        data: packet.data.clone(),
    }
}

fn make_audio_frame(id: u64, packet: &PendingPacket, config: &EngineConfig) -> AudioFrame {
    AudioFrame {
        id,
        pts: packet.pts,
        flags: packet.flags - BufferFlags::EXTRA_DATA,
        channels: config.audio.channels,
        sample_rate: config.audio.sample_rate,
        bits_per_sample: config.audio.bits_per_sample,
        data: packet.data.clone(),
    }
}

impl PassthroughEngine<VideoFrame> {
    pub fn video() -> Self {
        Self::with_maker(make_video_frame)
    }
}

impl PassthroughEngine<AudioFrame> {
    pub fn audio() -> Self {
        Self::with_maker(make_audio_frame)
    }
}

impl<F: DecodedFrame> PassthroughEngine<F> {
    fn with_maker(make: fn(u64, &PendingPacket, &EngineConfig) -> F) -> Self {
        Self {
            config: None,
            packets: VecDeque::new(),
            free_frames: VecDeque::new(),
            decoded: VecDeque::new(),
            lent: HashSet::new(),
            make,
        }
    }

    fn reclaim_all_frames(&mut self, frame_count: usize) {
        self.decoded.clear();
        self.lent.clear();
        self.free_frames = (1..=frame_count as u64).collect();
    }
}

impl<F: DecodedFrame> DecoderEngine for PassthroughEngine<F> {
    type Frame = F;

    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        if config.frame_count == 0 || config.packet_count == 0 {
            return Err(PipelineError::BadParameter(
                "engine needs at least one packet and one frame".into(),
            ));
        }
        self.reclaim_all_frames(config.frame_count);
        self.packets.clear();
        self.config = Some(config.clone());
        Ok(())
    }

    fn put_packet(&mut self, packet: DecoderPacket<'_>) -> Result<()> {
        let Some(config) = &self.config else {
            return Err(PipelineError::Undefined("engine not initialised".into()));
        };
        if self.packets.len() >= config.packet_count {
            return Err(PipelineError::Overflow("no empty packet slot".into()));
        }
        if packet.data.len() > config.packet_buffer_size {
            return Err(PipelineError::InsufficientResources(format!(
                "packet of {} bytes exceeds the {} byte bitstream buffer",
                packet.data.len(),
                config.packet_buffer_size
            )));
        }
        self.packets.push_back(PendingPacket {
            data: Bytes::copy_from_slice(packet.data),
            pts: packet.pts,
            flags: packet.flags,
        });
        Ok(())
    }

    fn decode(&mut self) -> DecodeStatus {
        let Some(config) = &self.config else {
            return DecodeStatus::Fatal(-1);
        };
        let Some(front) = self.packets.front() else {
            return DecodeStatus::NoReadyPacket;
        };
        if front.flags.contains(BufferFlags::EXTRA_DATA) {
            self.packets.pop_front();
            return DecodeStatus::Ok;
        }
        let Some(id) = self.free_frames.pop_front() else {
            return DecodeStatus::NoEmptyFrame;
        };
        let Some(packet) = self.packets.pop_front() else {
            return DecodeStatus::NoReadyPacket;
        };
        let frame = (self.make)(id, &packet, config);
        self.decoded.push_back(frame);
        DecodeStatus::Ok
    }

    fn get_frame(&mut self) -> Option<F> {
        let frame = self.decoded.pop_front()?;
        self.lent.insert(frame.frame_id());
        Some(frame)
    }

    fn put_frame(&mut self, frame: &F) -> Result<()> {
        if !self.lent.remove(&frame.frame_id()) {
            return Err(PipelineError::BadParameter(format!(
                "frame {} is not lent out",
                frame.frame_id()
            )));
        }
        self.free_frames.push_back(frame.frame_id());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let frame_count = self.config.as_ref().map(|c| c.frame_count).unwrap_or(0);
        self.packets.clear();
        self.reclaim_all_frames(frame_count);
        Ok(())
    }
}

/// Builds [`PassthroughEngine`]s for any video or audio coding.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEngineFactory;

impl EngineFactory<VideoFrame> for PassthroughEngineFactory {
    fn create(&self, coding: Coding) -> Result<Box<dyn DecoderEngine<Frame = VideoFrame>>> {
        if !coding.is_video() {
            return Err(PipelineError::BadParameter(format!(
                "{:?} is not a video coding",
                coding
            )));
        }
        Ok(Box::new(PassthroughEngine::video()))
    }
}

impl EngineFactory<AudioFrame> for PassthroughEngineFactory {
    fn create(&self, coding: Coding) -> Result<Box<dyn DecoderEngine<Frame = AudioFrame>>> {
        if !coding.is_audio() {
            return Err(PipelineError::BadParameter(format!(
                "{:?} is not an audio coding",
                coding
            )));
        }
        Ok(Box::new(PassthroughEngine::audio()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frames: usize, packets: usize) -> EngineConfig {
        EngineConfig {
            coding: Coding::H264,
            packet_buffer_size: 1024,
            packet_count: packets,
            frame_count: frames,
            video: VideoPortFormat {
                width: 320,
                height: 240,
                ..Default::default()
            },
            audio: AudioPortFormat::default(),
        }
    }

    fn packet(data: &[u8], pts: i64, flags: BufferFlags) -> DecoderPacket<'_> {
        DecoderPacket { data, pts, flags }
    }

    #[test]
    fn test_packet_becomes_frame() {
        let mut engine = PassthroughEngine::video();
        engine.init(&config(2, 4)).unwrap();
        assert_eq!(engine.decode(), DecodeStatus::NoReadyPacket);

        engine.put_packet(packet(&[9, 9], 40, BufferFlags::EOS)).unwrap();
        assert_eq!(engine.decode(), DecodeStatus::Ok);
        let frame = engine.get_frame().unwrap();
        assert_eq!(frame.pts, 40);
        assert!(frame.flags.contains(BufferFlags::EOS));
        assert_eq!(frame.width, 320);
        assert_eq!(&frame.data[..], &[9, 9]);
        assert!(engine.get_frame().is_none());
    }

    #[test]
    fn test_frame_pool_exhaustion() {
        let mut engine = PassthroughEngine::video();
        engine.init(&config(1, 4)).unwrap();
        engine.put_packet(packet(&[1], 0, BufferFlags::empty())).unwrap();
        engine.put_packet(packet(&[2], 1, BufferFlags::empty())).unwrap();

        assert_eq!(engine.decode(), DecodeStatus::Ok);
        let frame = engine.get_frame().unwrap();
        assert_eq!(engine.decode(), DecodeStatus::NoEmptyFrame);

        engine.put_frame(&frame).unwrap();
        assert_eq!(engine.decode(), DecodeStatus::Ok);
        assert!(engine.put_frame(&frame).is_err(), "frame returned twice");
    }

    #[test]
    fn test_packet_slots_overflow() {
        let mut engine = PassthroughEngine::audio();
        engine.init(&config(1, 1)).unwrap();
        engine.put_packet(packet(&[1], 0, BufferFlags::empty())).unwrap();
        assert!(matches!(
            engine.put_packet(packet(&[2], 1, BufferFlags::empty())),
            Err(PipelineError::Overflow(_))
        ));
    }

    #[test]
    fn test_extra_data_produces_no_frame() {
        let mut engine = PassthroughEngine::video();
        engine.init(&config(2, 4)).unwrap();
        engine
            .put_packet(packet(&[0, 0, 1], 0, BufferFlags::EXTRA_DATA))
            .unwrap();
        assert_eq!(engine.decode(), DecodeStatus::Ok);
        assert!(engine.get_frame().is_none());
        assert_eq!(engine.decode(), DecodeStatus::NoReadyPacket);
    }

    #[test]
    fn test_uninitialised_engine_is_fatal() {
        let mut engine = PassthroughEngine::video();
        assert!(matches!(engine.decode(), DecodeStatus::Fatal(_)));
    }

    #[test]
    fn test_factory_checks_domain() {
        let factory = PassthroughEngineFactory;
        let video: Result<Box<dyn DecoderEngine<Frame = VideoFrame>>> =
            factory.create(Coding::Aac);
        assert!(video.is_err());
        let audio: Result<Box<dyn DecoderEngine<Frame = AudioFrame>>> =
            factory.create(Coding::Aac);
        assert!(audio.is_ok());
    }
}
