//! Circuit breaker implementation for preventing cascading failures
//!
//! One breaker exists per provider identity. All counters and the state live
//! behind a single lock so every transition is one critical section; concurrent
//! successes and failures cannot interleave into a lost transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};

use super::CircuitState;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time the circuit stays open before trial calls are admitted
    pub cooldown: Duration,

    /// Number of successful trial calls needed to close the circuit
    pub success_threshold: u32,

    /// Maximum concurrent trial calls while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_calls: 1,
        }
    }
}

/// Admission ticket for one call; hand it back through exactly one of the
/// `record_*` methods or [`CircuitBreaker::release`].
///
/// A trial permit dropped without being resolved frees its slot, so a call
/// whose future is dropped mid-flight cannot wedge the breaker half-open.
///
/// Permits are stamped with the breaker epoch they were issued in. A permit
/// resolved after the breaker changed state only adds to the totals.
#[derive(Debug)]
#[must_use = "a permit must be resolved with record_success, record_failure or release"]
pub struct Permit {
    epoch: u64,
    trial: Option<Arc<Mutex<BreakerState>>>,
}

impl Permit {
    /// Whether this call was admitted as a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Detach the trial slot, reporting whether there was one
    fn take_trial(&mut self) -> bool {
        self.trial.take().is_some()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(state) = self.trial.take() {
            let mut inner = state.lock();
            CircuitBreaker::settle(&mut inner, self.epoch, true);
        }
    }
}

/// How a finished call should be accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Cancelled, or rejected for a reason that says nothing about provider health
    Neutral,
}

impl Outcome {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(err) => Self::of_error(err),
        }
    }

    pub fn of_error(err: &DispatchError) -> Self {
        if err.counts_as_provider_failure() {
            Outcome::Failure
        } else {
            Outcome::Neutral
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    trials_in_flight: u32,
    /// Bumped on every state transition
    epoch: u64,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_successes: 0,
            trials_in_flight: 0,
            epoch: 0,
            opened_at: None,
            total_failures: 0,
            total_successes: 0,
        }
    }
}

/// A thread-safe circuit breaker for one provider identity
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the specified configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make a call
    ///
    /// Fails with `CircuitOpen` while the cooldown has not elapsed, or when
    /// every half-open trial slot is taken.
    pub fn try_acquire(&self) -> Result<Permit> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(self.config.cooldown);
            if elapsed < self.config.cooldown {
                let remaining = self.config.cooldown - elapsed;
                return Err(DispatchError::circuit_open(format!(
                    "{} rejecting calls for another {}ms",
                    self.name,
                    remaining.as_millis()
                )));
            }
            self.transition_to_half_open(&mut inner);
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                epoch: inner.epoch,
                trial: None,
            }),
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_max_calls {
                    return Err(DispatchError::circuit_open(format!(
                        "{} half-open, trial capacity exhausted",
                        self.name
                    )));
                }
                inner.trials_in_flight += 1;
                Ok(Permit {
                    epoch: inner.epoch,
                    trial: Some(Arc::clone(&self.inner)),
                })
            }
            CircuitState::Open => Err(DispatchError::circuit_open(self.name.clone())),
        }
    }

    /// Record a successful call
    pub fn record_success(&self, mut permit: Permit) {
        let trial = permit.take_trial();
        let mut inner = self.inner.lock();
        let current = Self::settle(&mut inner, permit.epoch, trial);
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed if current => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if current && trial => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold {
                    self.close_circuit(&mut inner);
                }
            }
            _ => {
                debug!(breaker = %self.name, state = %inner.state, "Ignoring stale success");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, mut permit: Permit) {
        let trial = permit.take_trial();
        let mut inner = self.inner.lock();
        let current = Self::settle(&mut inner, permit.epoch, trial);
        inner.total_failures += 1;

        if !current {
            debug!(breaker = %self.name, state = %inner.state, "Ignoring stale failure");
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open_circuit(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens and restarts the cooldown
                self.open_circuit(&mut inner);
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Ignoring failure while already open");
            }
        }
    }

    /// Give a permit back without touching the failure/success counters
    pub fn release(&self, mut permit: Permit) {
        let trial = permit.take_trial();
        let mut inner = self.inner.lock();
        Self::settle(&mut inner, permit.epoch, trial);
    }

    /// Resolve a permit according to a call outcome
    pub fn record(&self, permit: Permit, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.record_success(permit),
            Outcome::Failure => self.record_failure(permit),
            Outcome::Neutral => self.release(permit),
        }
    }

    /// Get the current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn trial_successes(&self) -> u32 {
        self.inner.lock().trial_successes
    }

    /// Point-in-time view for status reporting
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trial_successes: inner.trial_successes,
            open_for_ms: inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    /// Free the trial slot of a permit from the current epoch
    ///
    /// Returns whether the permit belongs to the current epoch.
    fn settle(inner: &mut BreakerState, epoch: u64, trial: bool) -> bool {
        let current = inner.epoch == epoch;
        if current && trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        current
    }

    fn open_circuit(&self, inner: &mut BreakerState) {
        warn!(
            breaker = %self.name,
            from = %inner.state,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opening"
        );
        inner.state = CircuitState::Open;
        inner.epoch += 1;
        inner.opened_at = Some(Instant::now());
        inner.trial_successes = 0;
    }

    fn close_circuit(&self, inner: &mut BreakerState) {
        info!(breaker = %self.name, "Circuit breaker closing");
        inner.state = CircuitState::Closed;
        inner.epoch += 1;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
        inner.trial_successes = 0;
    }

    fn transition_to_half_open(&self, inner: &mut BreakerState) {
        info!(breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
        inner.state = CircuitState::HalfOpen;
        inner.epoch += 1;
        inner.trial_successes = 0;
        inner.trials_in_flight = 0;
    }
}

/// Serializable view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trial_successes: u32,
    pub open_for_ms: Option<u64>,
    pub total_failures: u64,
    pub total_successes: u64,
}
