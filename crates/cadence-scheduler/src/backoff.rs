use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Maps a failed attempt number to the delay before the next attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately.
    #[default]
    None,
    /// `attempt * base`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffStrategy::None => "none",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(BackoffStrategy::None),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after the `attempt`-th (1-based) failed attempt.
    ///
    /// Saturates instead of overflowing for very large attempt counts.
    pub fn delay(self, attempt: u32, base: Duration) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Retry settings resolved for one job at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `max_retries = k` allows `k` attempts in total, and always at least one.
    pub fn for_job(job: &dyn Job, default_base: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: job.max_retries().max(1),
            strategy: job.backoff_strategy(),
            base_delay: job.backoff_base_delay().unwrap_or(default_base),
            max_delay,
        }
    }

    /// Whether another attempt is permitted after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`, clamped to `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.strategy
            .delay(attempt, self.base_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    #[test]
    fn none_is_immediate() {
        assert_eq!(BackoffStrategy::None.delay(1, BASE), Duration::ZERO);
        assert_eq!(BackoffStrategy::None.delay(9, BASE), Duration::ZERO);
    }

    #[test]
    fn linear_grows_by_base() {
        assert_eq!(BackoffStrategy::Linear.delay(1, BASE), Duration::from_millis(100));
        assert_eq!(BackoffStrategy::Linear.delay(3, BASE), Duration::from_millis(300));
    }

    #[test]
    fn exponential_doubles() {
        assert_eq!(BackoffStrategy::Exponential.delay(1, BASE), Duration::from_millis(100));
        assert_eq!(BackoffStrategy::Exponential.delay(2, BASE), Duration::from_millis(200));
        assert_eq!(BackoffStrategy::Exponential.delay(4, BASE), Duration::from_millis(800));
    }

    #[test]
    fn exponential_saturates_on_huge_attempts() {
        let d = BackoffStrategy::Exponential.delay(200, Duration::from_secs(1));
        assert!(d >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn policy_clamps_and_counts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: BASE,
            max_delay: Duration::from_millis(250),
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Exponential".parse(), Ok(BackoffStrategy::Exponential));
        assert!("fibonacci".parse::<BackoffStrategy>().is_err());
    }
}
