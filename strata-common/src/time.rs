//! # Time Source
//!
//! The store never reads the clock directly; every timestamp comes from a
//! `TimeSource` so expiry behavior is deterministic under test. Readings
//! are milliseconds and must be monotone non-decreasing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Read-only clock consumed by the store.
///
/// Implementations must guarantee `now_ms() >= prior now_ms()`; wall-clock
/// steps backwards would otherwise resurrect expired entries.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time source backed by `SystemTime`.
///
/// Clamps to the latest reading so NTP adjustments cannot move the store
/// clock backwards.
#[derive(Debug, Default)]
pub struct SystemTimeSource {
    floor: AtomicU64,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        SystemTimeSource {
            floor: AtomicU64::new(0),
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // fetch_max returns the prior floor; report whichever is later.
        let prior = self.floor.fetch_max(wall, Ordering::Relaxed);
        wall.max(prior)
    }
}

/// Manually advanced time source for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        ManualTimeSource {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::Relaxed);
    }

    /// Jumps the clock to an absolute reading, never backwards.
    pub fn set(&self, now_ms: u64) {
        self.now.fetch_max(now_ms, Ordering::Relaxed);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
