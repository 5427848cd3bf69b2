// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wall-clock sources the reference clock and renderers read.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Monotonic microsecond time source.
///
/// Thread-safe; all methods may be called concurrently from any component.
pub trait TimeSource: Send + Sync {
    /// Microseconds since an arbitrary epoch. Never decreases.
    fn now_us(&self) -> i64;

    /// Human-readable description, for logging.
    fn description(&self) -> &str;
}

/// `Instant`-backed source; the default.
pub struct MonotonicTimeSource {
    start: Instant,
}

impl MonotonicTimeSource {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now_us(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    fn description(&self) -> &str {
        "Monotonic"
    }
}

/// Source that only moves when told to. Used to make media-time arithmetic
/// deterministic.
#[derive(Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_us: i64) -> Self {
        Self {
            now: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, now_us: i64) {
        self.now.fetch_max(now_us, Ordering::AcqRel);
    }

    pub fn advance(&self, delta_us: i64) {
        self.now.fetch_add(delta_us.max(0), Ordering::AcqRel);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_us(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn description(&self) -> &str {
        "Manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotonic_source_advances() {
        let source = MonotonicTimeSource::new();
        let t1 = source.now_us();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = source.now_us();
        assert!(t2 - t1 >= 5_000, "Should be at least 5ms");
    }

    #[test]
    fn test_monotonic_source_never_decreases() {
        let source = MonotonicTimeSource::new();
        let mut last = source.now_us();
        for _ in 0..100 {
            let now = source.now_us();
            assert!(now >= last, "Time must be monotonic");
            last = now;
        }
    }

    #[test]
    fn test_manual_source() {
        let source = ManualTimeSource::new(1_000);
        assert_eq!(source.now_us(), 1_000);
        source.advance(500);
        assert_eq!(source.now_us(), 1_500);
        source.set(1_200);
        assert_eq!(source.now_us(), 1_500, "set must not move time backwards");
        source.set(2_000);
        assert_eq!(source.now_us(), 2_000);
        assert_eq!(source.description(), "Manual");
    }
}
