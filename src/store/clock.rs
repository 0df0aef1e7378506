//! Wall-clock sources for the in-process store.
//!
//! The Redis adapter reads time from the Redis server so every instance
//! agrees on it. The memory store needs a local clock, which tests replace
//! with `MockClock`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same time value, so advancing one clone advances all.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<u64>>,
}

impl MockClock {
    /// Create a clock frozen at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_millis)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis() as u64;
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: u64) {
        *self.now.lock() = millis;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_epoch() {
        assert!(SystemClock::new().now_millis() > 1_600_000_000_000);
    }

    #[test]
    fn test_mock_clock_advance_is_shared() {
        let clock = MockClock::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        clock.set(5);
        assert_eq!(other.now_millis(), 5);
    }
}
