//! Resilience patterns for provider calls
//!
//! This module provides:
//! - Retry with exponential backoff, interruptible by cancellation
//! - A circuit breaker per provider identity
//! - A facade that consults the breaker before every attempt

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, Outcome, Permit};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryConfig, RetryExecutor};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DispatchError, ErrorContext, Result};
use crate::provider::ProviderIdentity;

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,

    /// Circuit is open, rejecting requests
    Open,

    /// Circuit is admitting a bounded number of trial requests
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Retry and circuit breaking composed around one provider call
#[derive(Debug, Clone)]
pub struct Resilience {
    retry: RetryExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl Resilience {
    pub fn new(retry: RetryConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            retry: RetryExecutor::new(retry),
            breakers,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Execute a provider call with breaker admission on every attempt
    ///
    /// A breaker that opens between attempts stops the retry loop with
    /// `CircuitOpen`. Cancellation aborts both the in-flight attempt and any
    /// backoff wait; a cancelled attempt does not count against the provider.
    pub async fn execute<F, Fut, T>(
        &self,
        identity: &ProviderIdentity,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(identity);

        self.retry
            .execute(cancel, |attempt| {
                let breaker = Arc::clone(&breaker);
                let call = operation(attempt);
                async move {
                    let permit = breaker.try_acquire().map_err(|e| {
                        e.with_context(ErrorContext::new().provider(identity))
                    })?;

                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(DispatchError::cancelled("cancelled during provider call")),
                        result = call => result,
                    };

                    let outcome = Outcome::of(&result);
                    debug!(provider = %identity, attempt, ?outcome, "Provider attempt finished");
                    breaker.record(permit, outcome);
                    result.map_err(|e| e.with_context(ErrorContext::new().provider(identity)))
                }
            })
            .await
    }
}
