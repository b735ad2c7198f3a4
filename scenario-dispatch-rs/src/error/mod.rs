//! Error handling for the scenario dispatch engine
//!
//! This module provides the error taxonomy shared by every stage:
//! - Resolution-stage errors (missing configuration, missing source data)
//! - Dispatch-stage errors (circuit open, transient and permanent upstream failures)
//! - Operational errors (config store, credentials, invalid configuration)
//! - Context carried for operator diagnosis (scenario, provider, snapshot version)

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod mapping;

/// Result type for dispatch engine operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Main error type for the dispatch engine
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No active format or provider for the scenario and environment
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    /// Required source data missing while composing a payload
    #[error("Field resolution failed for '{field}': {reason}")]
    FieldResolution { field: String, reason: String },

    /// Provider rejected by circuit-breaker policy, no network attempt made
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Timeout, connection reset or 5xx-equivalent failure
    #[error("Transient upstream error: {0}")]
    UpstreamTransient(String),

    /// Malformed request or auth rejection
    #[error("Permanent upstream error: {0}")]
    UpstreamPermanent(String),

    /// Transient failures persisted past the retry bound
    #[error("Upstream error after {attempts} attempts: {message}")]
    Upstream { attempts: u32, message: String },

    /// Caller cancelled the dispatch
    #[error("Dispatch cancelled: {0}")]
    Cancelled(String),

    /// Config store contents or engine settings violate an invariant
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Config store could not be read
    #[error("Config store error: {0}")]
    Store(String),

    /// Secret referenced by a provider could not be resolved
    #[error("Credential error: {0}")]
    Credential(String),

    /// Errors with additional context
    #[error("{inner}")]
    WithContext {
        inner: Box<DispatchError>,
        context: ErrorContext,
    },
}

/// Kind of a [`DispatchError`], with any context stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigNotFound,
    FieldResolution,
    CircuitOpen,
    UpstreamTransient,
    UpstreamPermanent,
    Upstream,
    Cancelled,
    InvalidConfig,
    Store,
    Credential,
}

impl DispatchError {
    pub fn config_not_found(message: impl Into<String>) -> Self {
        DispatchError::ConfigNotFound(message.into())
    }

    pub fn field_resolution(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DispatchError::FieldResolution {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        DispatchError::CircuitOpen(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        DispatchError::UpstreamTransient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DispatchError::UpstreamPermanent(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        DispatchError::Cancelled(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        DispatchError::InvalidConfig(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        DispatchError::Store(message.into())
    }

    pub fn credential(message: impl Into<String>) -> Self {
        DispatchError::Credential(message.into())
    }

    /// Convert a transient failure into the terminal error surfaced after retries ran out
    pub fn exhausted(attempts: u32, last: DispatchError) -> Self {
        let context = last.context().cloned();
        let error = DispatchError::Upstream {
            attempts,
            message: last.root().to_string(),
        };
        match context {
            Some(context) => error.with_context(context),
            None => error,
        }
    }

    /// Add context to an existing error, merging with any context already attached
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            DispatchError::WithContext {
                inner,
                context: existing,
            } => DispatchError::WithContext {
                inner,
                context: existing.merge(context),
            },
            other => DispatchError::WithContext {
                inner: Box::new(other),
                context,
            },
        }
    }

    /// Add a single context key/value to an existing error
    pub fn with_context_value(self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.with_context(ErrorContext::new().with(key, value))
    }

    /// The error with any context wrappers removed
    pub fn root(&self) -> &DispatchError {
        match self {
            DispatchError::WithContext { inner, .. } => inner.root(),
            other => other,
        }
    }

    /// Attached context, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            DispatchError::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            DispatchError::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            DispatchError::FieldResolution { .. } => ErrorKind::FieldResolution,
            DispatchError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            DispatchError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            DispatchError::UpstreamPermanent(_) => ErrorKind::UpstreamPermanent,
            DispatchError::Upstream { .. } => ErrorKind::Upstream,
            DispatchError::Cancelled(_) => ErrorKind::Cancelled,
            DispatchError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DispatchError::Store(_) => ErrorKind::Store,
            DispatchError::Credential(_) => ErrorKind::Credential,
            DispatchError::WithContext { .. } => unreachable!("root() strips context"),
        }
    }

    /// Only classified-transient upstream failures are retried
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::UpstreamTransient
    }

    /// Local contract failures that must never reach a provider
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConfigNotFound | ErrorKind::FieldResolution
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind() == ErrorKind::CircuitOpen
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Whether this failure counts against a provider's circuit breaker
    pub fn counts_as_provider_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamTransient | ErrorKind::Upstream
        )
    }
}

/// Diagnostic context attached to errors; never holds credential material
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub scenario: Option<String>,

    /// Provider identity (`platform/endpoint_id`)
    pub provider: Option<String>,

    pub snapshot_version: Option<u64>,

    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    pub data: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            timestamp: Some(chrono::Utc::now()),
            ..Self::default()
        }
    }

    pub fn scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    pub fn provider(mut self, provider: impl fmt::Display) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn snapshot_version(mut self, version: u64) -> Self {
        self.snapshot_version = Some(version);
        self
    }

    /// Add a context value
    pub fn add<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.data.insert(key.into(), value.to_string());
    }

    /// Add a context value and return self (builder pattern)
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.add(key, value);
        self
    }

    /// Fields already set win; `other` fills the gaps
    fn merge(mut self, other: ErrorContext) -> Self {
        self.scenario = self.scenario.or(other.scenario);
        self.provider = self.provider.or(other.provider);
        self.snapshot_version = self.snapshot_version.or(other.snapshot_version);
        self.timestamp = self.timestamp.or(other.timestamp);
        for (key, value) in other.data {
            self.data.entry(key).or_insert(value);
        }
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(scenario) = &self.scenario {
            parts.push(format!("scenario={}", scenario));
        }
        if let Some(provider) = &self.provider {
            parts.push(format!("provider={}", provider));
        }
        if let Some(version) = self.snapshot_version {
            parts.push(format!("snapshot={}", version));
        }
        for (key, value) in &self.data {
            parts.push(format!("{}={}", key, value));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Convert reqwest errors to DispatchError
impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        mapping::classify_transport(&err)
    }
}

/// Convert serde_json errors to DispatchError
impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::invalid_config(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::store(format!("IO error: {}", err))
    }
}
