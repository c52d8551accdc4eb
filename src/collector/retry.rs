//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within its upper half.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure
    /// (1-based): `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let ceiling = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }

    /// Returns `true` once `attempt` consecutive failures exhaust the policy.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let policy = policy(false);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(500), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let policy = policy(true);
        for attempt in 1..=6 {
            let ceiling = RetryPolicy { jitter: false, ..policy }.delay(attempt);
            let delay = policy.delay(attempt);
            assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
            assert!(delay >= ceiling / 2, "{delay:?} < half of {ceiling:?}");
        }
    }

    #[test]
    fn exhausted_after_max_retries() {
        let policy = policy(false);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
