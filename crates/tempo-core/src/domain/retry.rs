//! Retry policy: decides how long a failed job waits before it is acquirable again.

use std::time::Duration;

/// Delay policy for failed jobs.
///
/// `delay = base_delay * multiplier^(failures - 1)`, so with base 2s and
/// multiplier 2.0 the first failure waits 2s, the second 4s, the third 8s.
/// A zero base delay makes the job acquirable immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for subsequent failures.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Retry as soon as the lease is released.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }

    /// Delay before the next attempt, given how many failures happened so far
    /// (1-indexed: the first failure is `1`).
    pub fn next_delay(&self, failures: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(1), Duration::ZERO);
        assert_eq!(policy.next_delay(10), Duration::ZERO);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(5, 32)]
    fn exponential_backoff(#[case] failures: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(failures), Duration::from_secs(expected_secs));
    }

    #[test]
    fn huge_exponents_saturate() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(u32::MAX), Duration::MAX);
    }
}
