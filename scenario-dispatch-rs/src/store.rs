//! Config Store collaborator
//!
//! The durable store of format definitions, provider rows and platform
//! selection keys is owned elsewhere. The engine only reads a full export of
//! it on every reload.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::format::FormatDefinition;
use crate::provider::ProviderConfig;

/// Everything a snapshot is built from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreContents {
    #[serde(default)]
    pub formats: Vec<FormatDefinition>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Platform-selection keys (`{SCENARIO}_PLATFORM` and the global default)
    #[serde(default)]
    pub platform_keys: BTreeMap<String, String>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the full current contents
    async fn load(&self) -> Result<StoreContents>;
}

/// Mutable in-memory store, shared between the engine and whoever edits it
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    contents: Arc<RwLock<StoreContents>>,
}

impl MemoryConfigStore {
    pub fn new(contents: StoreContents) -> Self {
        Self {
            contents: Arc::new(RwLock::new(contents)),
        }
    }

    /// Replace the whole contents
    pub fn replace(&self, contents: StoreContents) {
        *self.contents.write() = contents;
    }

    /// Edit the contents in place
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut StoreContents),
    {
        edit(&mut self.contents.write());
    }

    pub fn set_platform_key(&self, key: impl Into<String>, platform: impl Into<String>) {
        self.contents.write().platform_keys.insert(key.into(), platform.into());
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<StoreContents> {
        Ok(self.contents.read().clone())
    }
}

/// JSON export of the store, re-read on every load
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn load(&self) -> Result<StoreContents> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DispatchError::store(format!("Failed to read {}: {}", self.path.display(), e))
        })?;

        let contents: StoreContents = serde_json::from_str(&content).map_err(|e| {
            DispatchError::store(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        debug!(
            path = %self.path.display(),
            formats = contents.formats.len(),
            providers = contents.providers.len(),
            "Loaded config store export"
        );
        Ok(contents)
    }
}
