//! Retry with exponential backoff for transient upstream failures
//!
//! Only errors classified as transient are retried, the number of attempts is
//! bounded, and every backoff wait can be interrupted by cancellation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DispatchError, Result};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_interval: Duration,

    /// Maximum backoff duration
    pub max_interval: Duration,

    /// Multiplier for backoff between retries
    pub multiplier: f64,

    /// Jitter applied to each interval (0.0 disables it)
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryConfig {{ max_attempts: {}, initial_interval: {:?}, max_interval: {:?}, multiplier: {}, randomization_factor: {} }}",
            self.max_attempts,
            self.initial_interval,
            self.max_interval,
            self.multiplier,
            self.randomization_factor
        )
    }
}

/// Executor for retry operations with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.initial_interval,
            initial_interval: self.config.initial_interval,
            max_interval: self.config.max_interval,
            multiplier: self.config.multiplier,
            randomization_factor: self.config.randomization_factor,
            // Attempt count bounds the loop, not wall-clock time
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or is cancelled
    ///
    /// The closure receives the 1-based attempt number. Transient failures on
    /// the final attempt are converted into [`DispatchError::Upstream`].
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::cancelled("cancelled before attempt"));
            }

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(if attempt > 1 {
                    err.with_context_value("attempts", attempt)
                } else {
                    err
                });
            }

            if attempt >= max_attempts {
                return Err(DispatchError::exhausted(attempt, err));
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.max_interval);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient upstream failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DispatchError::cancelled(format!(
                        "cancelled during backoff after attempt {}",
                        attempt
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
