//! Credential store collaborator
//!
//! Provider rows carry only a `credential_ref`; the secret is looked up at
//! dispatch time and kept in a `SecretString` so it never reaches logs.

use std::collections::HashMap;
use std::env;

use parking_lot::RwLock;
use secrecy::SecretString;

use crate::error::{DispatchError, Result};

/// Source of provider secrets
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Result<SecretString>;
}

/// Secrets read from environment variables named by the credential reference
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore {
    prefix: Option<String>,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn variable_name(&self, credential_ref: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, credential_ref),
            None => credential_ref.to_string(),
        }
    }
}

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, credential_ref: &str) -> Result<SecretString> {
        let name = self.variable_name(credential_ref);
        match env::var(&name) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            _ => Err(DispatchError::credential(format!(
                "credential '{}' is not set",
                credential_ref
            ))),
        }
    }
}

/// In-memory credential store for testing or embedding
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential_ref: impl Into<String>, secret: impl Into<String>) {
        self.secrets.write().insert(credential_ref.into(), secret.into());
    }

    pub fn with(self, credential_ref: impl Into<String>, secret: impl Into<String>) -> Self {
        self.insert(credential_ref, secret);
        self
    }

    pub fn remove(&self, credential_ref: &str) {
        self.secrets.write().remove(credential_ref);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve(&self, credential_ref: &str) -> Result<SecretString> {
        self.secrets
            .read()
            .get(credential_ref)
            .map(|secret| SecretString::from(secret.clone()))
            .ok_or_else(|| {
                DispatchError::credential(format!("credential '{}' is not set", credential_ref))
            })
    }
}
