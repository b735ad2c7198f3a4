//! Cache Version Tagger
//!
//! Keys embed the format and provider versions that produced a response, so a
//! downstream cache can never serve a response built under a configuration
//! that has since been reloaded.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::format::{FormatDefinition, ResultBag};
use crate::provider::ProviderConfig;
use crate::snapshot::{Snapshot, SnapshotStore};

const KEY_PREFIX: &str = "sd";
const DIGEST_LEN: usize = 16;

/// Derive a cache key from explicit components
///
/// The trailing digest also covers the provider identity, so routing to a
/// different platform changes the key even when version numbers coincide.
pub fn cache_key(
    scenario: &str,
    fingerprint: &str,
    format: &FormatDefinition,
    provider: &ProviderConfig,
) -> String {
    let format_version = format.version.to_string();
    let provider_version = provider.version.to_string();
    let identity = provider.identity().to_string();

    let mut hasher = Sha256::new();
    for part in [
        scenario,
        fingerprint,
        format_version.as_str(),
        provider_version.as_str(),
        identity.as_str(),
    ] {
        hasher.update(part.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());

    format!(
        "{}:{}:{}:f{}:p{}:{}",
        KEY_PREFIX,
        scenario,
        fingerprint,
        format.version,
        provider.version,
        &digest[..DIGEST_LEN]
    )
}

/// Stable hash of a result bag, for callers without their own fingerprint
///
/// Object keys are sorted before hashing, so the insertion order of the bag
/// and of nested objects does not matter.
pub fn fingerprint(bag: &ResultBag) -> String {
    let canonical: Map<String, Value> = {
        let mut entries: Vec<_> = bag.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(k, v)| (k.clone(), canonicalize(v)))
            .collect()
    };

    let mut hasher = Sha256::new();
    hasher.update(Value::Object(canonical).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Cache keys computed against the currently published snapshot
#[derive(Debug, Clone)]
pub struct CacheVersionTagger {
    snapshots: SnapshotStore,
}

impl CacheVersionTagger {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self { snapshots }
    }

    pub fn cache_key(&self, scenario: &str, fingerprint: &str, environment: &str) -> Result<String> {
        let snapshot = self.snapshots.load();
        Self::cache_key_in(&snapshot, scenario, fingerprint, environment)
    }

    /// Same as [`cache_key`](Self::cache_key) against a captured snapshot
    pub fn cache_key_in(
        snapshot: &Snapshot,
        scenario: &str,
        fingerprint: &str,
        environment: &str,
    ) -> Result<String> {
        let format = snapshot.formats().resolve(scenario)?;
        let provider = snapshot.providers().select(scenario, environment)?;
        Ok(cache_key(scenario, fingerprint, &format, &provider))
    }
}
