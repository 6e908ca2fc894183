//! Retry policy: classifies failures and decides backoff delays.

use std::time::Duration;

use super::config::RetryConfig;
use crate::domain::{ErrorKind, HandlerError};

/// How a failure affects the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
    Cancelled,
}

/// What the executor should do with a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back to Pending as retry number `attempt`, claimable after `delay`.
    Requeue {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Fail {
        reason: String,
    },
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Immediate requeue, no backoff.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn classify(&self, err: &HandlerError) -> FailureClass {
        match err {
            HandlerError::Storage(storage) if storage.is_transient() => FailureClass::Retryable,
            _ => match err.kind() {
                ErrorKind::Transient => FailureClass::Retryable,
                ErrorKind::Permanent | ErrorKind::Infrastructure => FailureClass::Fatal,
                ErrorKind::Cancelled => FailureClass::Cancelled,
            },
        }
    }

    /// Decide the next transition for a task that failed with `err` after
    /// `retry_count` retries out of `max_retries`.
    pub fn decide(&self, retry_count: u32, max_retries: u32, err: &HandlerError) -> RetryDecision {
        match self.classify(err) {
            FailureClass::Cancelled => RetryDecision::Cancel,
            FailureClass::Fatal => RetryDecision::Fail {
                reason: err.to_string(),
            },
            FailureClass::Retryable if retry_count < max_retries => {
                let attempt = retry_count + 1;
                RetryDecision::Requeue {
                    attempt,
                    delay: self.next_delay(attempt),
                    reason: err.to_string(),
                }
            }
            FailureClass::Retryable => RetryDecision::Fail {
                reason: format!("{err} (gave up after {max_retries} retries)"),
            },
        }
    }

    /// Delay before retry number `attempt` (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    ///
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
