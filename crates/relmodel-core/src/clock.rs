//! Time source for auto-generated audit values.
//!
//! The clock is an explicit dependency injected into the session at
//! construction rather than a process-wide singleton, so tests stay
//! deterministic.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current UTC time as microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// The current time, in microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A clock pinned to a settable instant, for tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    /// Create a fixed clock at the given instant.
    #[must_use]
    pub fn at(micros: i64) -> Self {
        Self {
            now: AtomicI64::new(micros),
        }
    }

    /// Move the clock to a new instant.
    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::Relaxed);
    }

    /// Advance the clock by a delta.
    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_settable() {
        let clock = FixedClock::at(1_000);
        assert_eq!(clock.now_micros(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_micros(), 1_500);

        clock.set(10);
        assert_eq!(clock.now_micros(), 10);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
        assert!(a > 0);
    }
}
