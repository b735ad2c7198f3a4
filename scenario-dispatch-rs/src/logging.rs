//! # Structured Logging
//!
//! Installs the process-wide tracing subscriber used by the daemon and by
//! embedders that do not bring their own.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{DispatchError, Result};

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The log level to use when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub level: String,
    /// The service name attached to the startup line
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "scenario-dispatch".to_string(),
            json_format: false,
        }
    }
}

/// Initializes the structured logging system
///
/// Calling this more than once is harmless; the first subscriber wins.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            DispatchError::invalid_config(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let installed = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true);
        Registry::default().with(filter).with(json_layer).try_init()
    } else {
        let text_layer = fmt::layer().with_target(true).with_thread_ids(true);
        Registry::default().with(filter).with(text_layer).try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(
                service = %config.service_name,
                json = config.json_format,
                "Logging initialized"
            );
        }
        Err(e) => {
            tracing::debug!("Tracing subscriber already installed: {}", e);
        }
    }

    Ok(())
}
