//! End-to-end request handling
//!
//! A request captures the current snapshot once and uses it for every step:
//! format lookup, composition, provider selection, cache key and dispatch.
//! A reload that lands mid-request is invisible to it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache_key;
use crate::dispatch::{DispatchResponse, DispatchStream, Dispatcher};
use crate::error::{ErrorContext, Result};
use crate::format::{FieldResolver, ResultBag};
use crate::provider::{ProviderConfig, ProviderIdentity};
use crate::snapshot::SnapshotStore;

/// Dispatch request envelope from the calculation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub scenario: String,
    #[serde(default)]
    pub result_bag: ResultBag,
    /// Falls back to the engine's configured environment
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    /// Caller-supplied stable hash of the result bag
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl DispatchRequest {
    pub fn new(scenario: impl Into<String>, result_bag: ResultBag) -> Self {
        Self {
            scenario: scenario.into(),
            result_bag,
            environment: None,
            streaming: false,
            fingerprint: None,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Complete {
        response: Value,
        cache_key: String,
        snapshot_version: u64,
        provider: ProviderIdentity,
    },
    Streaming {
        stream: DispatchStream,
        cache_key: String,
        snapshot_version: u64,
        provider: ProviderIdentity,
    },
}

impl DispatchOutcome {
    pub fn cache_key(&self) -> &str {
        match self {
            DispatchOutcome::Complete { cache_key, .. } | DispatchOutcome::Streaming { cache_key, .. } => {
                cache_key
            }
        }
    }

    pub fn snapshot_version(&self) -> u64 {
        match self {
            DispatchOutcome::Complete { snapshot_version, .. }
            | DispatchOutcome::Streaming { snapshot_version, .. } => *snapshot_version,
        }
    }

    pub fn provider(&self) -> &ProviderIdentity {
        match self {
            DispatchOutcome::Complete { provider, .. } | DispatchOutcome::Streaming { provider, .. } => {
                provider
            }
        }
    }
}

pub struct ScenarioEngine {
    snapshots: SnapshotStore,
    resolver: FieldResolver,
    dispatcher: Arc<Dispatcher>,
    environment: String,
    fallback_on_open: bool,
}

impl ScenarioEngine {
    pub fn new(snapshots: SnapshotStore, dispatcher: Arc<Dispatcher>, environment: impl Into<String>) -> Self {
        Self {
            snapshots,
            resolver: FieldResolver::new(),
            dispatcher,
            environment: environment.into(),
            fallback_on_open: false,
        }
    }

    /// Re-route to the default platform when the selected circuit is open
    pub fn with_fallback_on_open(mut self, enabled: bool) -> Self {
        self.fallback_on_open = enabled;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn dispatch(&self, request: DispatchRequest, cancel: CancellationToken) -> Result<DispatchOutcome> {
        let snapshot = self.snapshots.load();
        let version = snapshot.version_id;
        let scenario = request.scenario.as_str();
        let environment = request.environment.as_deref().unwrap_or(&self.environment);
        let context = || {
            ErrorContext::new()
                .scenario(scenario)
                .snapshot_version(version)
                .with("environment", environment)
        };

        let format = snapshot.formats().resolve(scenario).map_err(|e| e.with_context(context()))?;
        let payload = self
            .resolver
            .compose(&format, &request.result_bag)
            .map_err(|e| e.with_context(context()))?;
        let selection = snapshot.providers().selection(scenario, environment)?;

        let fingerprint = match &request.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => cache_key::fingerprint(&request.result_bag),
        };
        let payload = payload.into_value();

        let primary = Arc::clone(&selection.selected);
        let result = self
            .dispatcher
            .dispatch(&primary, payload.clone(), request.streaming, &cancel)
            .await;

        let (provider, response) = match result {
            Ok(response) => (primary, response),
            Err(err) if err.is_circuit_open() && self.fallback_on_open => {
                match fallback_for(&primary, selection.default.as_ref()) {
                    Some(fallback) => {
                        warn!(
                            scenario,
                            from = %primary.identity(),
                            to = %fallback.identity(),
                            "Circuit open, dispatching to default platform"
                        );
                        let response = self
                            .dispatcher
                            .dispatch(&fallback, payload, request.streaming, &cancel)
                            .await
                            .map_err(|e| e.with_context(context()))?;
                        (fallback, response)
                    }
                    None => return Err(err.with_context(context())),
                }
            }
            Err(err) => return Err(err.with_context(context())),
        };

        let cache_key = cache_key::cache_key(scenario, &fingerprint, &format, &provider);
        let identity = provider.identity();
        info!(
            scenario,
            provider = %identity,
            snapshot_version = version,
            streaming = request.streaming,
            "Dispatch accepted"
        );

        Ok(match response {
            DispatchResponse::Complete(response) => DispatchOutcome::Complete {
                response,
                cache_key,
                snapshot_version: version,
                provider: identity,
            },
            DispatchResponse::Streaming(stream) => DispatchOutcome::Streaming {
                stream,
                cache_key,
                snapshot_version: version,
                provider: identity,
            },
        })
    }
}

fn fallback_for(
    primary: &Arc<ProviderConfig>,
    default: Option<&Arc<ProviderConfig>>,
) -> Option<Arc<ProviderConfig>> {
    default
        .filter(|candidate| candidate.identity() != primary.identity())
        .cloned()
}
