//! Per-provider circuit breakers
//!
//! Breakers are keyed by provider identity and outlive configuration reloads;
//! a provider that keeps its identity across a reload keeps its breaker state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::provider::ProviderIdentity;

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<ProviderIdentity, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for a provider, created closed on first use
    pub fn get(&self, identity: &ProviderIdentity) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(identity) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(identity.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(identity.to_string(), self.config.clone()))
        }))
    }

    /// Breaker for a provider only if one has been created
    pub fn existing(&self, identity: &ProviderIdentity) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(identity).cloned()
    }

    /// Status of every known breaker, sorted by name
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
