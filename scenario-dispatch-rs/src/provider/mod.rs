//! Provider Registry
//!
//! Decides which backend platform serves a scenario in an environment. The
//! decision is made from platform-selection keys when a snapshot is built and
//! served from that snapshot afterwards.

pub mod client;
pub mod credentials;

pub use client::{ChunkStream, HttpProviderClient, ProviderClient, ProviderRequest};
pub use credentials::{CredentialStore, EnvCredentialStore, MemoryCredentialStore};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, ErrorContext, Result};
use crate::snapshot::{Selection, Snapshot};

/// Interchangeable backend analysis platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Coze,
    Bailian,
    OpenaiCompatible,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Coze, Platform::Bailian, Platform::OpenaiCompatible];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Coze => "coze",
            Platform::Bailian => "bailian",
            Platform::OpenaiCompatible => "openai_compatible",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "coze" => Ok(Platform::Coze),
            "bailian" => Ok(Platform::Bailian),
            "openai_compatible" | "openai" => Ok(Platform::OpenaiCompatible),
            other => Err(DispatchError::invalid_config(format!("Unknown platform '{}'", other))),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One routing row: how to reach a platform for a scenario in an environment
///
/// `credential_ref` names a secret in the credential store; the secret itself
/// is never part of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub scenario: String,
    pub platform: Platform,
    pub credential_ref: String,
    pub endpoint_id: String,
    pub environment: String,
    #[serde(default = "default_true")]
    pub active: bool,
    pub version: u64,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

impl ProviderConfig {
    pub fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new(self.platform, self.endpoint_id.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("scenario", &self.scenario),
            ("credential_ref", &self.credential_ref),
            ("endpoint_id", &self.endpoint_id),
            ("environment", &self.environment),
            ("base_url", &self.base_url),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        match missing {
            Some((name, _)) => Err(DispatchError::invalid_config(format!(
                "provider row {}/{} has an empty {}",
                self.scenario, self.platform, name
            ))),
            None => Ok(()),
        }
    }
}

/// Circuit-breaker key: the platform plus the app/bot identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProviderIdentity {
    pub platform: Platform,
    pub endpoint_id: String,
}

impl ProviderIdentity {
    pub fn new(platform: Platform, endpoint_id: impl Into<String>) -> Self {
        Self {
            platform,
            endpoint_id: endpoint_id.into(),
        }
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.endpoint_id)
    }
}

/// Name of the scenario-specific platform override key
pub fn platform_override_key(scenario: &str) -> String {
    let upper: String = scenario
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_PLATFORM", upper)
}

/// Rows for one `(scenario, environment)` pair, keyed by platform
pub type PlatformRows = HashMap<Platform, Arc<ProviderConfig>>;

/// Pick the provider row for a scenario
///
/// The scenario override key wins when it names a platform that has a row;
/// otherwise the global default key is consulted. `Ok(None)` means neither
/// key selected an available row. A key naming an unknown platform is an
/// error.
pub fn resolve_selection(
    scenario: &str,
    rows: &PlatformRows,
    platform_keys: &BTreeMap<String, String>,
    default_key: &str,
) -> Result<Option<Arc<ProviderConfig>>> {
    let override_key = platform_override_key(scenario);

    for key in [override_key.as_str(), default_key] {
        let Some(raw) = platform_keys.get(key) else {
            continue;
        };
        let platform: Platform = raw
            .parse()
            .map_err(|e: DispatchError| e.with_context_value("selection_key", key))?;
        if let Some(row) = rows.get(&platform) {
            return Ok(Some(Arc::clone(row)));
        }
        tracing::debug!(
            scenario,
            key,
            %platform,
            "Selection key names a platform without an active row, falling through"
        );
    }

    Ok(None)
}

/// Provider selection over one captured snapshot
#[derive(Debug, Clone, Copy)]
pub struct ProviderRegistry<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> ProviderRegistry<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    /// Selected row plus the circuit-open fallback for a pair
    pub fn selection(&self, scenario: &str, environment: &str) -> Result<&'a Selection> {
        self.snapshot.selection(scenario, environment).map_err(|e| {
            e.with_context(
                ErrorContext::new()
                    .scenario(scenario)
                    .snapshot_version(self.snapshot.version_id)
                    .with("environment", environment),
            )
        })
    }

    pub fn select(&self, scenario: &str, environment: &str) -> Result<Arc<ProviderConfig>> {
        self.selection(scenario, environment).map(|s| Arc::clone(&s.selected))
    }
}
