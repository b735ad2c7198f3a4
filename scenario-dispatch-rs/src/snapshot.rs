//! Configuration snapshots
//!
//! A [`Snapshot`] is the immutable bundle of every active format definition
//! and provider selection. Requests capture one `Arc<Snapshot>` at their start
//! and use only that; reloads build a fresh snapshot and swap the pointer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DispatchError, Result};
use crate::format::{FormatDefinition, FormatRegistry};
use crate::provider::{resolve_selection, Platform, PlatformRows, ProviderConfig, ProviderRegistry};
use crate::store::StoreContents;

/// Routing decided for one `(scenario, environment)` pair
#[derive(Debug, Clone)]
pub struct Selection {
    pub selected: Arc<ProviderConfig>,
    /// Row named by the global default key, used for circuit-open fallback
    pub default: Option<Arc<ProviderConfig>>,
}

type RowKey = (String, Platform, String);

#[derive(Debug)]
pub struct Snapshot {
    pub version_id: u64,
    pub loaded_at: DateTime<Utc>,
    formats: BTreeMap<String, Arc<FormatDefinition>>,
    providers: BTreeMap<RowKey, Arc<ProviderConfig>>,
    /// scenario -> environment -> selection
    selections: HashMap<String, HashMap<String, Selection>>,
}

impl Snapshot {
    /// Placeholder published before the first successful load
    pub fn empty() -> Self {
        Self {
            version_id: 0,
            loaded_at: Utc::now(),
            formats: BTreeMap::new(),
            providers: BTreeMap::new(),
            selections: HashMap::new(),
        }
    }

    /// Build and validate a snapshot from store contents
    ///
    /// Inactive rows are ignored. When `previous` is given, a format whose
    /// structure changed must also carry a higher version.
    pub fn build(
        contents: &StoreContents,
        version_id: u64,
        default_platform_key: &str,
        previous: Option<&Snapshot>,
    ) -> Result<Self> {
        let mut formats = BTreeMap::new();
        for format in contents.formats.iter().filter(|f| f.active) {
            format.validate()?;
            if let Some(old) = previous.and_then(|p| p.formats.get(&format.name)) {
                if !old.same_structure(format) && format.version <= old.version {
                    return Err(DispatchError::invalid_config(format!(
                        "format '{}' changed structure without a version bump (still {})",
                        format.name, format.version
                    )));
                }
            }
            if formats.insert(format.name.clone(), Arc::new(format.clone())).is_some() {
                return Err(DispatchError::invalid_config(format!(
                    "duplicate active format '{}'",
                    format.name
                )));
            }
        }

        let mut providers = BTreeMap::new();
        let mut groups: HashMap<(String, String), PlatformRows> = HashMap::new();
        for row in contents.providers.iter().filter(|p| p.active) {
            row.validate()?;
            let row = Arc::new(row.clone());
            let key = (row.scenario.clone(), row.platform, row.environment.clone());
            if providers.insert(key, Arc::clone(&row)).is_some() {
                return Err(DispatchError::invalid_config(format!(
                    "duplicate active provider row for {}/{}/{}",
                    row.scenario, row.platform, row.environment
                )));
            }
            groups
                .entry((row.scenario.clone(), row.environment.clone()))
                .or_default()
                .insert(row.platform, row);
        }

        let keys = &contents.platform_keys;
        let default_platform = match keys.get(default_platform_key) {
            Some(raw) => Some(raw.parse::<Platform>().map_err(|e| {
                e.with_context_value("selection_key", default_platform_key)
            })?),
            None => None,
        };

        let mut selections: HashMap<String, HashMap<String, Selection>> = HashMap::new();
        for ((scenario, environment), rows) in &groups {
            let Some(selected) = resolve_selection(scenario, rows, keys, default_platform_key)? else {
                tracing::warn!(
                    scenario = %scenario,
                    environment = %environment,
                    "No platform-selection key picks an active provider row"
                );
                continue;
            };
            let default = default_platform.and_then(|p| rows.get(&p)).cloned();
            selections
                .entry(scenario.clone())
                .or_default()
                .insert(environment.clone(), Selection { selected, default });
        }

        Ok(Self {
            version_id,
            loaded_at: Utc::now(),
            formats,
            providers,
            selections,
        })
    }

    pub fn formats(&self) -> FormatRegistry<'_> {
        FormatRegistry::new(self)
    }

    pub fn providers(&self) -> ProviderRegistry<'_> {
        ProviderRegistry::new(self)
    }

    pub fn is_initial(&self) -> bool {
        self.version_id == 0
    }

    pub fn format(&self, scenario: &str) -> Result<Arc<FormatDefinition>> {
        self.formats.get(scenario).cloned().ok_or_else(|| {
            DispatchError::config_not_found(format!("no active format definition for '{}'", scenario))
        })
    }

    pub fn selection(&self, scenario: &str, environment: &str) -> Result<&Selection> {
        self.selections
            .get(scenario)
            .and_then(|by_env| by_env.get(environment))
            .ok_or_else(|| {
                DispatchError::config_not_found(format!(
                    "no active provider for '{}' in environment '{}'",
                    scenario, environment
                ))
            })
    }

    pub fn format_count(&self) -> usize {
        self.formats.len()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn scenarios(&self) -> Vec<&str> {
        self.formats.keys().map(String::as_str).collect()
    }

    fn selection_pairs(&self) -> impl Iterator<Item = (&String, &String)> + '_ {
        self.selections
            .iter()
            .flat_map(|(scenario, by_env)| by_env.keys().map(move |environment| (scenario, environment)))
    }

    /// Platforms routed to for a pair: the selected row and the fallback default
    fn routing(&self, scenario: &str, environment: &str) -> Option<(Platform, Option<Platform>)> {
        self.selections
            .get(scenario)
            .and_then(|by_env| by_env.get(environment))
            .map(|s| (s.selected.platform, s.default.as_ref().map(|d| d.platform)))
    }

    /// Count what differs between two snapshots
    ///
    /// Formats count when added, removed or re-versioned. Providers count per
    /// row added, removed or edited, plus per `(scenario, environment)` whose
    /// routing appeared, disappeared or moved (selected row or fallback
    /// default) without any involved row changing.
    pub fn diff(&self, previous: &Snapshot) -> SnapshotDiff {
        let names: BTreeSet<&String> = self.formats.keys().chain(previous.formats.keys()).collect();
        let changed_formats = names
            .into_iter()
            .filter(|name| {
                match (self.formats.get(*name), previous.formats.get(*name)) {
                    (Some(new), Some(old)) => new.version != old.version,
                    _ => true,
                }
            })
            .count();

        let row_keys: BTreeSet<&RowKey> =
            self.providers.keys().chain(previous.providers.keys()).collect();
        let mut changed_rows = BTreeSet::new();
        for key in row_keys {
            let changed = match (self.providers.get(key), previous.providers.get(key)) {
                (Some(new), Some(old)) => new != old,
                _ => true,
            };
            if changed {
                changed_rows.insert(key.clone());
            }
        }

        let pairs: BTreeSet<(&String, &String)> = self
            .selection_pairs()
            .chain(previous.selection_pairs())
            .collect();
        let rerouted = pairs
            .into_iter()
            .filter(|(scenario, environment)| {
                let new = self.routing(scenario, environment);
                let old = previous.routing(scenario, environment);
                if new == old {
                    return false;
                }
                // Routing that moved only because a row itself changed is already counted
                [new, old]
                    .into_iter()
                    .flatten()
                    .flat_map(|(selected, default)| [Some(selected), default])
                    .flatten()
                    .all(|platform| {
                        !changed_rows.contains(&((*scenario).clone(), platform, (*environment).clone()))
                    })
            })
            .count();

        SnapshotDiff {
            changed_formats,
            changed_providers: changed_rows.len() + rerouted,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub changed_formats: usize,
    pub changed_providers: usize,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changed_formats == 0 && self.changed_providers == 0
    }
}

/// Single-writer, many-reader publication point for the current snapshot
///
/// Readers never block; a publish is one pointer swap.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current: Arc<ArcSwap<Snapshot>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(Snapshot::empty())),
        }
    }

    /// Capture the current snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version_id
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }
}
