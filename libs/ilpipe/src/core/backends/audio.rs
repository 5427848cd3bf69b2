// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Audio output device boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::core::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioAttr {
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
}

pub trait AudioDevice: Send {
    fn init(&mut self) -> Result<()>;

    fn set_attr(&mut self, attr: AudioAttr) -> Result<()>;

    /// 0..=100.
    fn set_volume(&mut self, volume: u32) -> Result<()>;

    fn volume(&self) -> Result<u32>;

    /// Queue PCM data for playback.
    fn render(&mut self, data: &[u8]) -> Result<()>;

    /// Duration of queued-but-unplayed audio, microseconds.
    fn cached_time_us(&self) -> i64;

    fn pause(&mut self) -> Result<()>;

    fn clear_cache(&mut self) -> Result<()>;
}

/// Counters shared between a [`NullAudioDevice`] and whoever wants to observe
/// it.
#[derive(Debug, Default)]
pub struct NullAudioStats {
    pub inits: AtomicU64,
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub pauses: AtomicU64,
    pub volume: AtomicU32,
    /// Latency the device reports from `cached_time_us`.
    pub cached_time_us: AtomicI64,
}

/// Device that accepts everything and plays nothing.
pub struct NullAudioDevice {
    stats: Arc<NullAudioStats>,
    attr: Option<AudioAttr>,
    initialized: bool,
}

impl NullAudioDevice {
    pub fn new(stats: Arc<NullAudioStats>) -> Self {
        Self {
            stats,
            attr: None,
            initialized: false,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.initialized {
            return Err(PipelineError::Undefined("audio device not initialised".into()));
        }
        Ok(())
    }
}

impl AudioDevice for NullAudioDevice {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        self.stats.inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_attr(&mut self, attr: AudioAttr) -> Result<()> {
        self.ensure_ready()?;
        self.attr = Some(attr);
        Ok(())
    }

    fn set_volume(&mut self, volume: u32) -> Result<()> {
        self.ensure_ready()?;
        self.stats.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }

    fn volume(&self) -> Result<u32> {
        self.ensure_ready()?;
        Ok(self.stats.volume.load(Ordering::Relaxed))
    }

    fn render(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        if self.attr.is_none() {
            return Err(PipelineError::Undefined("audio attributes not set".into()));
        }
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn cached_time_us(&self) -> i64 {
        self.stats.cached_time_us.load(Ordering::Relaxed)
    }

    fn pause(&mut self) -> Result<()> {
        self.stats.pauses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear_cache(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_requires_init_and_attr() {
        let stats = Arc::new(NullAudioStats::default());
        let mut device = NullAudioDevice::new(Arc::clone(&stats));
        assert!(device.render(&[0; 4]).is_err());

        device.init().unwrap();
        assert!(device.render(&[0; 4]).is_err());

        device
            .set_attr(AudioAttr {
                channels: 2,
                sample_rate: 48_000,
                bits_per_sample: 16,
            })
            .unwrap();
        device.render(&[0; 4]).unwrap();
        assert_eq!(stats.frames.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_volume_is_clamped() {
        let stats = Arc::new(NullAudioStats::default());
        let mut device = NullAudioDevice::new(stats);
        device.init().unwrap();
        device.set_volume(250).unwrap();
        assert_eq!(device.volume().unwrap(), 100);
    }
}
