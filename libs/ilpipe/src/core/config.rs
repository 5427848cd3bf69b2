// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline tuning via `ilpipe.yaml`.
//!
//! Every section and field has a default, so an empty file (or none at all)
//! yields the stock configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemuxerConfig {
    /// Packet nodes pre-allocated for the video track.
    pub video_packet_nodes: usize,
    /// Packet nodes pre-allocated for the audio track.
    pub audio_packet_nodes: usize,
    /// Initial byte capacity of each packet node.
    pub initial_packet_capacity: usize,
    /// Back-off after a failed hand-off before retrying.
    pub retry_interval_ms: u64,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            video_packet_nodes: 32,
            audio_packet_nodes: 32,
            initial_packet_capacity: 16 * 1024,
            retry_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub packet_nodes_initial: usize,
    /// Nodes added each time the input pool runs dry.
    pub packet_nodes_step: usize,
    pub packet_nodes_max: usize,
    pub frame_nodes_max: usize,
    /// Poll interval while waiting for the engine to drain after end of stream.
    pub eos_poll_interval_ms: u64,
    /// Bitstream buffer handed to the engine at init.
    pub packet_buffer_size: usize,
    /// Frames the engine may hold at once.
    pub frame_count: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            packet_nodes_initial: 16,
            packet_nodes_step: 16,
            packet_nodes_max: 64,
            frame_nodes_max: 32,
            eos_poll_interval_ms: 5,
            packet_buffer_size: 1024 * 1024,
            frame_count: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioRenderConfig {
    pub frame_nodes_initial: usize,
    pub frame_nodes_step: usize,
    pub frame_nodes_max: usize,
    /// How long one idle wait for a ready frame lasts.
    pub frame_wait_interval_ms: u64,
    /// Starvation longer than this is treated as end of stream. `None`
    /// disables the heuristic.
    pub starvation_timeout_ms: Option<u64>,
    /// Minimum media time between two clock corrections.
    pub correction_interval_us: i64,
    /// Poll interval while waiting for the clock to start running.
    pub start_wait_ms: u64,
}

impl Default for AudioRenderConfig {
    fn default() -> Self {
        Self {
            frame_nodes_initial: 8,
            frame_nodes_step: 8,
            frame_nodes_max: 64,
            frame_wait_interval_ms: 50,
            starvation_timeout_ms: Some(5000),
            correction_interval_us: 1_000_000,
            start_wait_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoRenderConfig {
    pub frame_nodes_initial: usize,
    pub frame_nodes_step: usize,
    pub frame_nodes_max: usize,
    /// Frames within this distance of the media time are shown.
    pub sync_tolerance_us: i64,
    /// A timestamp this far from the media time is a discontinuity.
    pub pts_jump_threshold_us: i64,
    /// Frame delay assumed after a discontinuity.
    pub default_frame_delay_us: i64,
    pub start_wait_ms: u64,
}

impl Default for VideoRenderConfig {
    fn default() -> Self {
        Self {
            frame_nodes_initial: 8,
            frame_nodes_step: 8,
            frame_nodes_max: 64,
            sync_tolerance_us: 10_000,
            pts_jump_threshold_us: 10_000_000,
            default_frame_delay_us: 40_000,
            start_wait_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Audio corrections smaller than this leave the time base alone.
    pub drift_tolerance_us: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            drift_tolerance_us: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoEncoderConfig {
    pub frame_nodes_initial: usize,
    pub frame_nodes_step: usize,
    pub frame_nodes_max: usize,
    /// Packets that may be lent downstream at once.
    pub packet_nodes_max: usize,
    /// Quality used until the application sets one.
    pub default_quality: u32,
    /// Back-off after a refused hand-off before retrying.
    pub retry_interval_ms: u64,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            frame_nodes_initial: 4,
            frame_nodes_step: 4,
            frame_nodes_max: 32,
            packet_nodes_max: 32,
            default_quality: 90,
            retry_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub packet_nodes_initial: usize,
    pub packet_nodes_step: usize,
    pub packet_nodes_max: usize,
    /// Back-off while storage is full or a file cannot be opened.
    pub retry_interval_ms: u64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            packet_nodes_initial: 16,
            packet_nodes_step: 16,
            packet_nodes_max: 256,
            retry_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Sleep between attempts when returning buffers on the way to Loaded.
    pub give_back_retry_ms: u64,
    /// How often a still-blocked shutdown logs a warning. Retries never stop.
    pub diagnostic_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            give_back_retry_ms: 1,
            diagnostic_interval_ms: 1000,
        }
    }
}

/// Pipeline configuration from `ilpipe.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub demuxer: DemuxerConfig,
    pub decoder: DecoderConfig,
    pub audio_render: AudioRenderConfig,
    pub video_render: VideoRenderConfig,
    pub clock: ClockConfig,
    pub video_encoder: VideoEncoderConfig,
    pub muxer: MuxerConfig,
    pub shutdown: ShutdownConfig,
}

impl PipelineConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "ilpipe.yaml";

    /// Load configuration from a directory. Returns an error if the file is
    /// missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            PipelineError::Configuration(format!(
                "Failed to parse {}: {}",
                config_path.display(),
                e
            ))
        })?;

        tracing::info!("Loaded pipeline config from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a directory, falling back to defaults if the
    /// file is missing or unparseable.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.audio_render.correction_interval_us, 1_000_000);
        assert_eq!(config.clock.drift_tolerance_us, 10_000);
        assert_eq!(config.audio_render.starvation_timeout_ms, Some(5000));
        assert_eq!(config.video_render.default_frame_delay_us, 40_000);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = PipelineConfig::from_yaml(
            "audio_render:\n  starvation_timeout_ms: null\ndecoder:\n  packet_nodes_max: 8\n",
        )
        .unwrap();
        assert_eq!(config.audio_render.starvation_timeout_ms, None);
        assert_eq!(config.audio_render.frame_wait_interval_ms, 50);
        assert_eq!(config.decoder.packet_nodes_max, 8);
        assert_eq!(config.decoder.packet_nodes_step, 16);
    }

    #[test]
    fn test_recording_sections() {
        let config = PipelineConfig::from_yaml(
            "video_encoder:\n  default_quality: 60\nmuxer:\n  packet_nodes_max: 32\n",
        )
        .unwrap();
        assert_eq!(config.video_encoder.default_quality, 60);
        assert_eq!(config.video_encoder.packet_nodes_max, 32);
        assert_eq!(config.muxer.packet_nodes_max, 32);
        assert_eq!(config.muxer.retry_interval_ms, 10);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = PipelineConfig::from_yaml("  \n").unwrap();
        assert_eq!(config.demuxer.video_packet_nodes, 32);
    }
}
