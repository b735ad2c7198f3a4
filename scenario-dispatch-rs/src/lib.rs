//! # Scenario Dispatch
//!
//! Builds the request payload for an analysis scenario from independently
//! computed results and routes it to one of several interchangeable backend
//! platforms.
//!
//! This crate provides:
//!
//! - Format definitions describing how each scenario's payload is composed
//! - Provider selection per scenario through platform-selection keys
//! - Per-provider circuit breaking, bounded retry and streaming passthrough
//! - Hot reload of all configuration as one atomic snapshot swap
//! - Cache keys tagged with the configuration versions that produced them
//!
//! ## Architecture
//!
//! - `ConfigStore`: source of format definitions, provider rows and selection keys
//! - `Snapshot` / `SnapshotStore`: immutable configuration, swapped on reload
//! - `FieldResolver`: composes payloads from a `ResultBag`
//! - `Dispatcher`: sends payloads through `Resilience` to a `ProviderClient`
//! - `ScenarioEngine`: runs a `DispatchRequest` end to end against one snapshot

pub mod cache_key;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod format;
pub mod logging;
pub mod provider;
pub mod reload;
pub mod resilience;
pub mod snapshot;
pub mod store;
pub mod util;

pub use cache_key::CacheVersionTagger;
pub use config::{ConfigProvider, EngineConfig};
pub use dispatch::{DispatchResponse, DispatchStream, Dispatcher, StreamEvent};
pub use engine::{DispatchOutcome, DispatchRequest, ScenarioEngine};
pub use error::{DispatchError, ErrorContext, ErrorKind, Result};
pub use format::{ComposedPayload, FieldResolver, FieldSpec, FormatDefinition, FormatRegistry, ResultBag};
pub use provider::{Platform, ProviderConfig, ProviderIdentity, ProviderRegistry};
pub use reload::{ReloadCoordinator, ReloadSummary};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, Resilience};
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore, StoreContents};

#[cfg(test)]
mod tests;
