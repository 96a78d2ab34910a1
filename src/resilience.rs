//! Retry backoff for transient slave-store failures.
//!
//! The queue worker keeps a failing head operation in place and waits
//! [`RetryConfig::delay_for_attempt`] before trying it again. The delay grows
//! exponentially and is capped at `max_delay`.

use std::time::Duration;

/// Configuration for retrying a transiently failing operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries before the operation is dropped.
    /// Set to `usize::MAX` to retry forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Retry forever: a lost link is expected to come back.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 10       25.6s
    /// 11+      30s (cap)
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded retry: give up after `max_attempts` retries.
    pub fn bounded(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// True once `attempt` retries have used up the budget.
    pub fn is_exhausted(&self, attempt: usize) -> bool {
        self.max_attempts != usize::MAX && attempt >= self.max_attempts
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // Guard against overflow before building a Duration
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}
