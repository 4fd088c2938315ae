//! # Retry
//!
//! Exponential backoff schedule for publication attempts.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// How many times a publication is attempted and how long to wait in between.
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            max_attempts,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Interval to wait after failed attempt number `attempt` (starting at 1).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(self.maximum_interval);

        std::cmp::min(candidate_interval, self.maximum_interval)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sum of every backoff sleep when all attempts fail.
    pub fn total_backoff(&self) -> time::Duration {
        (1..self.max_attempts).map(|n| self.retry_interval(n)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: time::Duration::from_secs(2),
        }
    }
}
