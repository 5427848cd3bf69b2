// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Video output boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::core::buffer::VideoFrame;
use crate::core::error::{PipelineError, Result};

pub trait VideoDisplay: Send {
    fn init(&mut self) -> Result<()>;

    /// Put `frame` on screen. The display may keep referring to the frame's
    /// planes until the next call.
    fn render(&mut self, frame: &VideoFrame) -> Result<()>;
}

#[derive(Debug)]
pub struct NullDisplayStats {
    pub inits: AtomicU64,
    pub frames: AtomicU64,
    pub last_pts: AtomicI64,
}

impl Default for NullDisplayStats {
    fn default() -> Self {
        Self {
            inits: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            last_pts: AtomicI64::new(-1),
        }
    }
}

/// Display that counts what it would have shown.
pub struct NullVideoDisplay {
    stats: Arc<NullDisplayStats>,
    initialized: bool,
}

impl NullVideoDisplay {
    pub fn new(stats: Arc<NullDisplayStats>) -> Self {
        Self {
            stats,
            initialized: false,
        }
    }
}

impl VideoDisplay for NullVideoDisplay {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        self.stats.inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn render(&mut self, frame: &VideoFrame) -> Result<()> {
        if !self.initialized {
            return Err(PipelineError::Undefined("display not initialised".into()));
        }
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats.last_pts.store(frame.pts, Ordering::Relaxed);
        Ok(())
    }
}
