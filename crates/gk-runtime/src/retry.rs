// retry.rs - Bounded retry with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_attempt_timeout_ms() -> u64 {
    30_000
}

/// How many times to invoke a tool and how long to wait between tries.
///
/// Only ToolError and Timeout outcomes are retried. `max_attempts` counts
/// the first try, so 1 means no retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Deadline for a single invocation.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay before attempt `completed + 1`, after `completed` failed tries.
    ///
    /// `initial * multiplier^(completed - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_after(&self, completed: u32) -> Duration {
        let exponent = completed.saturating_sub(1).min(63) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_attempts == 0 {
            return Err(RuntimeError::InvalidRetryPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RuntimeError::InvalidRetryPolicy(format!(
                "backoff_multiplier must be a finite number >= 1 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(RuntimeError::InvalidRetryPolicy(
                "attempt_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
