//! Exponential backoff for outbox delivery

use std::time::{Duration, Instant};

/// Delay schedule applied after consecutive delivery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures (`failures >= 1`)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Backoff state owned by the sync engine
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            retry_at: None,
        }
    }

    /// Whether a round may hit the network at `now`
    pub fn is_ready(&self, now: Instant) -> bool {
        !matches!(self.retry_at, Some(retry_at) if now < retry_at)
    }

    /// Time left before the next attempt is allowed
    pub fn remaining(&self, now: Instant) -> Duration {
        self.retry_at
            .map_or(Duration::ZERO, |retry_at| retry_at.saturating_duration_since(now))
    }

    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Register a failed round; returns the delay before the next attempt
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.delay_for(self.failures);
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=8).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_defers_until_retry_time() {
        let start = Instant::now();
        let mut backoff = Backoff::new(RetryPolicy::default());
        assert!(backoff.is_ready(start));

        let delay = backoff.record_failure(start);
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!backoff.is_ready(start));
        assert!(backoff.is_ready(start + Duration::from_secs(1)));

        backoff.record_failure(start);
        assert_eq!(backoff.remaining(start), Duration::from_secs(2));
        assert_eq!(backoff.failures(), 2);
    }

    #[test]
    fn success_resets_backoff() {
        let start = Instant::now();
        let mut backoff = Backoff::new(RetryPolicy::default());
        backoff.record_failure(start);
        backoff.record_failure(start);
        backoff.record_success();

        assert!(backoff.is_ready(start));
        assert_eq!(backoff.record_failure(start), Duration::from_secs(1));
    }
}
