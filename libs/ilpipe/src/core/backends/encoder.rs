// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Encoder engine boundary: one raw picture in, one compressed packet out.

use bytes::Bytes;

use crate::core::buffer::{BufferFlags, VideoFrame};
use crate::core::error::{PipelineError, Result};
use crate::core::params::Coding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub coding: Coding,
    pub width: u32,
    pub height: u32,
    /// 1..=100.
    pub quality: u32,
}

impl EncoderSettings {
    /// Largest packet a picture may compress to: four fifths of the raw
    /// pixel count, scaled by quality.
    pub fn packet_capacity(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        pixels * 4 / 5 * self.quality as usize / 100
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub flags: BufferFlags,
}

pub trait EncoderEngine: Send {
    fn init(&mut self, settings: &EncoderSettings) -> Result<()>;

    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedPacket>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self, coding: Coding) -> Result<Box<dyn EncoderEngine>>;
}

/// Software stand-in for a still-picture encoder: the packet carries the
/// picture bytes unchanged, bounded by the configured packet capacity.
#[derive(Debug, Default)]
pub struct PassthroughEncoder {
    settings: Option<EncoderSettings>,
}

impl EncoderEngine for PassthroughEncoder {
    fn init(&mut self, settings: &EncoderSettings) -> Result<()> {
        if settings.width == 0 || settings.height == 0 {
            return Err(PipelineError::BadParameter(format!(
                "picture size {}x{} is empty",
                settings.width, settings.height
            )));
        }
        if !(1..=100).contains(&settings.quality) {
            return Err(PipelineError::BadParameter(format!(
                "quality {} is outside 1..=100",
                settings.quality
            )));
        }
        self.settings = Some(*settings);
        Ok(())
    }

    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedPacket> {
        let Some(settings) = &self.settings else {
            return Err(PipelineError::Undefined("encoder not initialised".into()));
        };
        let capacity = settings.packet_capacity();
        if frame.data.len() > capacity {
            return Err(PipelineError::InsufficientResources(format!(
                "picture of {} bytes exceeds the {} byte packet buffer",
                frame.data.len(),
                capacity
            )));
        }
        Ok(EncodedPacket {
            data: frame.data.clone(),
            pts: frame.pts,
            flags: frame.flags | BufferFlags::KEY_FRAME,
        })
    }
}

/// Builds [`PassthroughEncoder`]s. Only MJPEG output is offered.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoderFactory;

impl EncoderFactory for PassthroughEncoderFactory {
    fn create(&self, coding: Coding) -> Result<Box<dyn EncoderEngine>> {
        if coding != Coding::Mjpeg {
            return Err(PipelineError::BadParameter(format!(
                "{:?} encoding is not supported",
                coding
            )));
        }
        Ok(Box::new(PassthroughEncoder::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(quality: u32) -> EncoderSettings {
        EncoderSettings {
            coding: Coding::Mjpeg,
            width: 10,
            height: 10,
            quality,
        }
    }

    fn frame(len: usize, flags: BufferFlags) -> VideoFrame {
        VideoFrame {
            pts: 40_000,
            flags,
            data: Bytes::from(vec![7u8; len]),
            ..Default::default()
        }
    }

    #[test]
    fn test_packet_capacity_scales_with_quality() {
        assert_eq!(settings(100).packet_capacity(), 80);
        assert_eq!(settings(50).packet_capacity(), 40);
    }

    #[test]
    fn test_picture_becomes_key_frame_packet() {
        let mut encoder = PassthroughEncoder::default();
        encoder.init(&settings(100)).unwrap();
        let packet = encoder.encode(&frame(16, BufferFlags::EOS)).unwrap();
        assert_eq!(packet.pts, 40_000);
        assert_eq!(packet.data.len(), 16);
        assert!(packet.flags.contains(BufferFlags::EOS | BufferFlags::KEY_FRAME));
    }

    #[test]
    fn test_oversized_picture_is_refused() {
        let mut encoder = PassthroughEncoder::default();
        encoder.init(&settings(50)).unwrap();
        assert!(matches!(
            encoder.encode(&frame(41, BufferFlags::empty())),
            Err(PipelineError::InsufficientResources(_))
        ));
    }

    #[test]
    fn test_settings_are_validated() {
        let mut encoder = PassthroughEncoder::default();
        assert!(encoder.encode(&frame(1, BufferFlags::empty())).is_err());
        assert!(encoder.init(&settings(0)).is_err());
        assert!(
            encoder
                .init(&EncoderSettings {
                    width: 0,
                    ..settings(90)
                })
                .is_err()
        );
    }

    #[test]
    fn test_factory_offers_mjpeg_only() {
        assert!(PassthroughEncoderFactory.create(Coding::Mjpeg).is_ok());
        assert!(PassthroughEncoderFactory.create(Coding::H264).is_err());
    }
}
