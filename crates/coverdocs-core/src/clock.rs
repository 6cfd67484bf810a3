//! Clock capability.
//!
//! Timestamps persisted to the metadata store come from `utc_now()`;
//! deadlines and timeouts come from the monotonic `instant_now()`. Tests
//! swap in [`TestClock`] and advance wall time without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time, used for persisted timestamps.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Monotonic instant, used for latency measurement and deadlines.
    fn instant_now(&self) -> Instant {
        Instant::now()
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Starts at the real current time and applies an adjustable offset, so
/// lease-expiry and backoff-visibility tests can jump forward instantly.
#[derive(Debug)]
pub struct TestClock {
    base: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Utc::now(),
            offset_ms: AtomicI64::new(0),
        })
    }

    /// Jump the clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn utc_now(&self) -> DateTime<Utc> {
        self.base + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotone() {
        let clock = SystemClock;
        let a = clock.utc_now();
        let b = clock.utc_now();
        assert!(b >= a);
    }

    #[test]
    fn test_test_clock_advance() {
        let clock = TestClock::new();
        let before = clock.utc_now();
        clock.advance(Duration::seconds(600));
        let after = clock.utc_now();
        assert_eq!((after - before).num_seconds(), 600);
    }

    #[test]
    fn test_test_clock_shared_view() {
        let clock = TestClock::new();
        let other = clock.clone();
        clock.advance(Duration::seconds(5));
        assert_eq!(other.utc_now(), clock.utc_now());
    }
}
