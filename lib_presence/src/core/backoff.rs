//! # Reconnect Backoff
//!
//! Deterministic exponential backoff: `delay(n) = min(base * 2^n, max)`.
//! There is no random jitter; the same attempt number always yields the same
//! wait, which keeps reconnect behaviour reproducible in tests.

use std::time::Duration;

/// Maps a reconnect attempt number to the wait before that attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Creates a policy. `max` bounds every delay the policy will return.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// First-attempt delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound of any delay.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Wait before attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Overflow in either the power or the multiplication already means "past the cap".
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(3000))
    }

    #[test]
    fn doubles_until_capped() {
        let p = policy();
        assert_eq!(p.delay(0), p.base());
        assert_eq!(p.delay(0), Duration::from_millis(1000));
        assert_eq!(p.delay(1), Duration::from_millis(2000));
        assert_eq!(p.delay(2), Duration::from_millis(3000));
        assert_eq!(p.delay(3), Duration::from_millis(3000));
    }

    #[test]
    fn monotonic_and_bounded_for_all_attempts() {
        let p = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(60));
        let mut previous = Duration::ZERO;
        for attempt in 0..=u32::from(u8::MAX) {
            let d = p.delay(attempt);
            assert!(d >= previous, "delay({}) decreased", attempt);
            assert!(d <= p.max());
            previous = d;
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let p = policy();
        assert_eq!(p.delay(u32::MAX), p.max());
        assert_eq!(p.delay(40), p.max());
    }
}
