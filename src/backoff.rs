//! Exponential backoff for peer-address retry scheduling.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Initial per-address backoff delay.
const INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Multiplier applied to the delay after each failure.
const BACKOFF_FACTOR: f64 = 1.5;
/// Per-address backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(10 * 60);

/// Ceiling for the group-wide backoff, which tracks systemic failures (e.g.
/// DNS unreachable) separately from any one address.
const MAX_GROUP_DELAY: Duration = Duration::from_secs(60);

/// Tracks the next-eligible-retry instant for one peer address (or, with
/// [`ExponentialBackoff::group()`], for the address book as a whole).
///
/// A success resets the delay to [`INITIAL_DELAY`]; a failure multiplies it
/// by [`BACKOFF_FACTOR`], capped at a ceiling fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    delay: Duration,
    ceiling: Duration,
    next_retry: DateTime<Utc>,
}

impl ExponentialBackoff {
    /// A fresh per-address backoff record, eligible for immediate retry.
    pub fn new(now: DateTime<Utc>) -> ExponentialBackoff {
        ExponentialBackoff {
            delay: INITIAL_DELAY,
            ceiling: MAX_DELAY,
            next_retry: now,
        }
    }

    /// A fresh group-wide backoff record, with its shorter ceiling.
    pub fn group(now: DateTime<Utc>) -> ExponentialBackoff {
        ExponentialBackoff {
            delay: INITIAL_DELAY,
            ceiling: MAX_GROUP_DELAY,
            next_retry: now,
        }
    }

    /// The instant at which this address becomes eligible for retry again.
    pub fn next_retry(&self) -> DateTime<Utc> {
        self.next_retry
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_retry
    }

    /// Record a successful connection: reset the delay to its initial value.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.delay = INITIAL_DELAY;
        self.next_retry = now;
    }

    /// Record a failed connection attempt: multiply the delay, capped at the
    /// ceiling, and schedule the next retry from `now`.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        let scaled = self.delay.mul_f64(BACKOFF_FACTOR);
        self.delay = scaled.min(self.ceiling);
        self.next_retry = now + chrono::Duration::from_std(self.delay).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.timestamp(1_600_000_000, 0)
    }

    #[test]
    fn failures_monotonically_increase_the_retry_instant_until_the_cap() {
        let now = epoch();
        let mut backoff = ExponentialBackoff::new(now);
        let mut previous = backoff.next_retry();
        for _ in 0..40 {
            backoff.record_failure(now);
            let current = backoff.next_retry();
            assert!(current >= previous);
            previous = current;
        }
        assert!(backoff.delay <= MAX_DELAY);
    }

    #[test]
    fn success_resets_delay() {
        let now = epoch();
        let mut backoff = ExponentialBackoff::new(now);
        for _ in 0..10 {
            backoff.record_failure(now);
        }
        assert!(backoff.delay > INITIAL_DELAY);
        backoff.record_success(now);
        assert_eq!(backoff.delay, INITIAL_DELAY);
    }

    #[test]
    fn group_backoff_has_a_shorter_ceiling() {
        let now = epoch();
        let mut backoff = ExponentialBackoff::group(now);
        for _ in 0..40 {
            backoff.record_failure(now);
        }
        assert!(backoff.delay <= MAX_GROUP_DELAY);
    }
}
