//! Reconnect backoff strategies.
//!
//! A strategy maps the number of consecutive failed connection attempts to
//! either a delay before the next attempt or a decision to abandon.

use std::time::Duration;

/// Decides how long to wait before the next connection attempt.
pub trait BackoffStrategy: Send + Sync + std::fmt::Debug {
    /// `failures` is the number of consecutive failed attempts so far
    /// (always >= 1). Returns `None` to abandon reconnection.
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Linear ramp capped at a ceiling. Never abandons.
///
/// Delay is `min(failures * step, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedLinear {
    pub step: Duration,
    pub max_delay: Duration,
}

impl CappedLinear {
    pub fn new(step: Duration, max_delay: Duration) -> Self {
        Self { step, max_delay }
    }
}

impl Default for CappedLinear {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(3000))
    }
}

impl BackoffStrategy for CappedLinear {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        Some(self.step.saturating_mul(failures).min(self.max_delay))
    }
}

/// Constant delay with a hard ceiling on attempts.
///
/// Up to `max_attempts` failures are retried; the failure after that
/// abandons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl BackoffStrategy for FixedDelay {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures > self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_linear_ramp() {
        let backoff = CappedLinear::default();

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(5), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(30), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_capped_linear_never_gives_up() {
        let backoff = CappedLinear::default();
        assert_eq!(backoff.next_delay(u32::MAX), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_fixed_delay_ceiling() {
        let backoff = FixedDelay::new(Duration::from_millis(50), 3);

        for failures in 1..=3 {
            assert_eq!(backoff.next_delay(failures), Some(Duration::from_millis(50)));
        }
        assert_eq!(backoff.next_delay(4), None);
        assert_eq!(backoff.next_delay(100), None);
    }
}
