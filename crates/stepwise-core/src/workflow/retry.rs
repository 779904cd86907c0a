//! Retry policy for step execution.
//!
//! Exponential backoff with optional jitter. Stateless: the attempt number
//! travels on the step-task message and the StepRun record, so a retry
//! survives a process restart.

use std::time::Duration;

use rand::Rng;
use stepwise_types::workflow::RetryConfig;

/// Resolved retry behaviour for one state.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Jitter factor (0.0-1.0). 0.1 means +/-10%.
    pub jitter: f64,
    /// Error classes that are never retried.
    pub non_retryable: Vec<String>,
}

impl RetryPolicy {
    /// A policy that never retries. Applied to states without `retry`.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable: Vec::new(),
        }
    }

    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        match config {
            Some(c) => Self {
                max_attempts: c.max_attempts.max(1),
                initial_interval: Duration::from_millis(c.initial_interval_ms),
                max_interval: Duration::from_millis(c.max_interval_ms.max(c.initial_interval_ms)),
                backoff_coefficient: c.backoff_coefficient.max(1.0),
                jitter: c.jitter.clamp(0.0, 1.0),
                non_retryable: c.non_retryable.clone(),
            },
            None => Self::no_retry(),
        }
    }

    /// Whether a failure of `class` on `attempt` (1-based) gets another attempt.
    pub fn should_retry(&self, attempt: u32, class: &str, retryable: bool) -> bool {
        retryable
            && attempt < self.max_attempts
            && !self.non_retryable.iter().any(|c| c == class)
    }

    /// Delay before `next_attempt` (1-based; the first retry is attempt 2).
    pub fn delay_for_attempt(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = next_attempt - 1;
        let base = self.initial_interval.as_millis() as f64
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_millis() as f64);

        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered.round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}
