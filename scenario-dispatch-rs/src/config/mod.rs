//! Configuration management for the dispatch engine
//!
//! This module provides utilities for loading and validating the engine's
//! operational knobs (circuit breaker, retry, reload cadence, routing keys)
//! from environment variables or in-memory maps.

use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::logging::LoggingConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::util::parse_duration;

/// Prefix used by the daemon for every environment variable
pub const ENV_PREFIX: &str = "SCENARIO_DISPATCH";

/// Base trait for configuration providers
pub trait ConfigProvider: Send + Sync {
    /// Raw value for a key, `None` when unset
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Typed accessors for configuration providers
///
/// A missing key falls back to the default; a present but malformed value is
/// an error rather than a silent default.
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a required string value
    fn get_string(&self, key: &str) -> Result<String> {
        self.lookup(key)
            .ok_or_else(|| DispatchError::invalid_config(format!("Configuration key not set: {}", key)))
    }

    /// Get a string value with a default
    fn get_string_or(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    /// Get a parsed value with a default
    fn get_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        <T as FromStr>::Err: std::fmt::Display,
    {
        match self.lookup(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                DispatchError::invalid_config(format!("Invalid value for key {}: {}", key, e))
            }),
        }
    }

    /// Get a boolean value with a default
    fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.lookup(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(DispatchError::invalid_config(format!(
                    "Invalid boolean value for key {}: {}",
                    key, raw
                ))),
            },
        }
    }

    /// Get a duration value (`200ms`, `30s`, `5m`, `1h`) with a default
    fn get_duration_or(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.lookup(key) {
            None => Ok(default),
            Some(raw) => parse_duration(&raw).ok_or_else(|| {
                DispatchError::invalid_config(format!("Invalid duration for key {}: {}", key, raw))
            }),
        }
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProviderExt for T {}

/// Environment variable based configuration provider
#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    /// Optional prefix for environment variables
    prefix: Option<String>,
}

impl EnvConfigProvider {
    /// Create a new environment variable config provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a prefix for environment variables
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Format a configuration key as an environment variable
    fn format_key(&self, key: &str) -> String {
        let key = key
            .to_uppercase()
            .replace(|c: char| !c.is_ascii_alphanumeric(), "_");

        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key),
            None => key,
        }
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn lookup(&self, key: &str) -> Option<String> {
        env::var(self.format_key(key)).ok()
    }
}

/// In-memory config provider for testing or static configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigProvider {
    values: HashMap<String, String>,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a configuration value
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: ToString,
    {
        self.values.insert(key.into(), value.to_string());
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Operational settings for the dispatch engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub circuit_breaker: CircuitBreakerConfig,

    pub retry: RetryConfig,

    /// Period of the background reload task; zero disables it
    pub reload_interval: Duration,

    /// Environment used when a request does not name one
    pub environment: String,

    /// Name of the global default platform-selection key
    pub default_platform_key: String,

    /// Re-route to the default platform when the selected circuit is open
    pub fallback_on_open: bool,

    pub upstream_timeout: Duration,

    /// JSON export of the config store read on every reload
    pub store_path: Option<PathBuf>,

    /// Bind address of the operator control endpoint
    pub control_addr: String,

    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            reload_interval: Duration::from_secs(60),
            environment: "production".to_string(),
            default_platform_key: "DEFAULT_PLATFORM".to_string(),
            fallback_on_open: false,
            upstream_timeout: Duration::from_secs(60),
            store_path: None,
            control_addr: "0.0.0.0:8090".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a config provider
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Result<Self> {
        let defaults = Self::default();
        let cb = &defaults.circuit_breaker;
        let retry = &defaults.retry;

        let config = Self {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: provider.get_or("cb_failure_threshold", cb.failure_threshold)?,
                cooldown: provider.get_duration_or("cb_cooldown", cb.cooldown)?,
                success_threshold: provider.get_or("cb_success_threshold", cb.success_threshold)?,
                half_open_max_calls: provider
                    .get_or("cb_half_open_max_calls", cb.half_open_max_calls)?,
            },
            retry: RetryConfig {
                max_attempts: provider.get_or("retry_max_attempts", retry.max_attempts)?,
                initial_interval: provider
                    .get_duration_or("retry_initial_interval", retry.initial_interval)?,
                max_interval: provider.get_duration_or("retry_max_interval", retry.max_interval)?,
                multiplier: provider.get_or("retry_multiplier", retry.multiplier)?,
                randomization_factor: provider
                    .get_or("retry_jitter", retry.randomization_factor)?,
            },
            reload_interval: provider.get_duration_or("reload_interval", defaults.reload_interval)?,
            environment: provider.get_string_or("environment", &defaults.environment),
            default_platform_key: provider
                .get_string_or("default_platform_key", &defaults.default_platform_key),
            fallback_on_open: provider.get_bool_or("fallback_on_open", defaults.fallback_on_open)?,
            upstream_timeout: provider
                .get_duration_or("upstream_timeout", defaults.upstream_timeout)?,
            store_path: provider.lookup("config_store_path").map(PathBuf::from),
            control_addr: provider.get_string_or("control_addr", &defaults.control_addr),
            logging: LoggingConfig {
                level: provider.get_string_or("log_level", &defaults.logging.level),
                json_format: provider.get_bool_or("log_json", defaults.logging.json_format)?,
                ..defaults.logging.clone()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the state machine or retry loop cannot honour
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_max_calls == 0 {
            return Err(DispatchError::invalid_config(
                "circuit breaker thresholds must be at least 1",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(DispatchError::invalid_config("retry_max_attempts must be at least 1"));
        }
        if retry.initial_interval > retry.max_interval {
            return Err(DispatchError::invalid_config(
                "retry_initial_interval must not exceed retry_max_interval",
            ));
        }
        if retry.multiplier < 1.0 {
            return Err(DispatchError::invalid_config("retry_multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.randomization_factor) {
            return Err(DispatchError::invalid_config("retry_jitter must be within 0.0..=1.0"));
        }

        if self.environment.trim().is_empty() || self.default_platform_key.trim().is_empty() {
            return Err(DispatchError::invalid_config(
                "environment and default_platform_key must not be empty",
            ));
        }

        Ok(())
    }
}
