//! Injected time sources.
//!
//! The upstream design reaches for a global clock singleton so that tests
//! can fast-forward time; here that becomes an explicit trait object passed
//! into every constructor that needs it, per the "global mutable state"
//! redesign note.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

/// A source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// A monotonic instant, used for timeouts and RTT measurement.
    fn monotonic_now(&self) -> Instant;
}

/// The production clock, backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// `monotonic_now` is derived from the same offset as `now`, so advancing
/// one advances the other; there is no wall-clock sleeping involved.
pub struct MockClock {
    epoch: Instant,
    offset_secs: AtomicI64,
    base: DateTime<Utc>,
}

impl MockClock {
    /// Construct a mock clock starting at `base`.
    pub fn new(base: DateTime<Utc>) -> Arc<MockClock> {
        Arc::new(MockClock {
            epoch: Instant::now(),
            offset_secs: AtomicI64::new(0),
            base,
        })
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.offset_secs
            .fetch_add(delta.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = self.offset_secs.load(Ordering::SeqCst);
        Utc.timestamp(self.base.timestamp() + offset, 0)
    }

    fn monotonic_now(&self) -> Instant {
        let offset = self.offset_secs.load(Ordering::SeqCst);
        self.epoch + Duration::from_secs(offset.max(0) as u64)
    }
}
