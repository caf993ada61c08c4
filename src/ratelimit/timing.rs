//! Clocks and bucket alignment.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Floor `timestamp` to the start of its bucket.
pub fn period_marker(resolution: u64, timestamp: u64) -> u64 {
    (timestamp / resolution) * resolution
}

/// Source of wall-clock time in epoch seconds.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        // Pre-epoch system clocks are clamped to zero.
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can hold one handle while the
/// store and analyzer hold others.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` (epoch seconds).
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, timestamp: u64) {
        self.now.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_marker() {
        assert_eq!(period_marker(10, 0), 0);
        assert_eq!(period_marker(10, 9), 0);
        assert_eq!(period_marker(10, 10), 10);
        assert_eq!(period_marker(600, 1_704_067_799), 1_704_067_200);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock::new().now() > 1_577_836_800);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1000);
        let other = clock.clone();

        other.advance(15);
        assert_eq!(clock.now(), 1015);

        clock.set(50);
        assert_eq!(other.now(), 50);
    }
}
