//! The monotonic clock the loop steps against.

use std::time::{Duration, Instant};

/// A point on the monotonic clock with millisecond arithmetic.
///
/// The loop samples it once at the beginning of a step and again right after
/// the kernel wait; timers are compared against the sampled value, not a
/// fresh one, so every timer that expired during the wait fires in the same
/// pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeCounter(Instant);

impl TimeCounter {
    /// Sample the monotonic clock.
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// The point `offset` after `self`.
    pub fn offset_by(self, offset: Duration) -> Self {
        Self(self.0 + offset)
    }

    /// Whether `self` is at or past `other`.
    pub fn is_later_than_or_equal(self, other: Self) -> bool {
        self.0 >= other.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the
    /// future.
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_orders() {
        let t = TimeCounter::now();
        let later = t.offset_by(Duration::from_millis(5));
        assert!(later.is_later_than_or_equal(t));
        assert!(!t.is_later_than_or_equal(later));
        assert_eq!(
            later.saturating_duration_since(t),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn saturates_backwards() {
        let t = TimeCounter::now();
        let later = t.offset_by(Duration::from_millis(1));
        assert_eq!(t.saturating_duration_since(later), Duration::ZERO);
    }
}
