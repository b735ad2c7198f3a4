//! Hot-Reload Coordinator
//!
//! Reads the config store, builds a new snapshot and publishes it in one
//! pointer swap. Reloads are serialized; request dispatch never waits on them.
//! Circuit breaker state lives outside snapshots and survives every reload.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ErrorContext, Result};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::ConfigStore;

/// Outcome of one reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub changed_formats: usize,
    pub changed_providers: usize,
    pub new_version: u64,
    pub previous_version: u64,
}

impl ReloadSummary {
    /// Whether a new snapshot was published
    pub fn published(&self) -> bool {
        self.new_version != self.previous_version
    }
}

pub struct ReloadCoordinator {
    store: Arc<dyn ConfigStore>,
    snapshots: SnapshotStore,
    default_platform_key: String,
    // Serializes writers so version numbers stay monotonic
    reload_lock: Mutex<()>,
}

impl ReloadCoordinator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        snapshots: SnapshotStore,
        default_platform_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            snapshots,
            default_platform_key: default_platform_key.into(),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Rebuild the snapshot from the store and publish it if anything changed
    ///
    /// On error the current snapshot stays published.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        let current = self.snapshots.load();

        let contents = self.store.load().await.map_err(|e| {
            e.with_context(ErrorContext::new().snapshot_version(current.version_id))
        })?;

        let candidate = Snapshot::build(
            &contents,
            current.version_id + 1,
            &self.default_platform_key,
            Some(&current),
        )
        .map_err(|e| {
            error!(current_version = current.version_id, error = %e, "Rejected config store contents");
            e.with_context(ErrorContext::new().snapshot_version(current.version_id))
        })?;

        let diff = candidate.diff(&current);
        if diff.is_empty() && !current.is_initial() {
            debug!(version = current.version_id, "Config store unchanged, keeping snapshot");
            return Ok(ReloadSummary {
                changed_formats: 0,
                changed_providers: 0,
                new_version: current.version_id,
                previous_version: current.version_id,
            });
        }

        let published = self.snapshots.publish(candidate);
        info!(
            version = published.version_id,
            previous_version = current.version_id,
            changed_formats = diff.changed_formats,
            changed_providers = diff.changed_providers,
            formats = published.format_count(),
            providers = published.provider_count(),
            "Published configuration snapshot"
        );

        Ok(ReloadSummary {
            changed_formats: diff.changed_formats,
            changed_providers: diff.changed_providers,
            new_version: published.version_id,
            previous_version: current.version_id,
        })
    }

    /// Reload on a fixed period until `cancel` fires
    ///
    /// Failed reloads are logged and retried at the next tick.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_ms = period.as_millis() as u64, "Starting periodic config reload");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial load is done by the caller
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Periodic config reload stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload().await {
                            error!(error = %e, "Periodic config reload failed");
                        }
                    }
                }
            }
        })
    }
}
