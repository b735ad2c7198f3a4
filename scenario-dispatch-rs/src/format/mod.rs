//! Format Registry
//!
//! A format definition describes, field by field, how the payload for a
//! scenario is assembled from the computed results. Definitions are loaded
//! into snapshots and never mutated; an edit arrives as a new version.

pub mod resolver;

pub use resolver::{ComposedPayload, FieldResolver};

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DispatchError, ErrorContext, Result};
use crate::snapshot::Snapshot;

fn default_true() -> bool {
    true
}

/// How one output field is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSpec {
    /// Value taken from a named entry of the result bag
    Result {
        data_source: String,
        /// Single dot-separated sub-path
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Several sub-paths, emitted as an ordered mapping keyed by path
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<String>>,
        #[serde(default)]
        optional: bool,
    },

    /// Nested group resolved as one unit
    Composite {
        structure: IndexMap<String, FieldSpec>,
        #[serde(default)]
        optional: bool,
    },

    /// Constant emitted as-is
    Literal { value: Value },
}

impl FieldSpec {
    pub fn is_optional(&self) -> bool {
        match self {
            FieldSpec::Result { optional, .. } | FieldSpec::Composite { optional, .. } => *optional,
            FieldSpec::Literal { .. } => false,
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        match self {
            FieldSpec::Result {
                data_source,
                field,
                fields,
                ..
            } => {
                if data_source.trim().is_empty() {
                    return Err(invalid(path, "result field has no data_source"));
                }
                if field.is_some() && fields.is_some() {
                    return Err(invalid(path, "result field sets both 'field' and 'fields'"));
                }
                let paths = field.iter().chain(fields.iter().flatten());
                if let Some(bad) = paths.into_iter().find(|p| p.split('.').any(str::is_empty)) {
                    return Err(invalid(path, &format!("malformed sub-path '{}'", bad)));
                }
                if matches!(fields, Some(list) if list.is_empty()) {
                    return Err(invalid(path, "'fields' is empty"));
                }
                Ok(())
            }
            FieldSpec::Composite { structure, .. } => {
                if structure.is_empty() {
                    return Err(invalid(path, "composite field has no sub-fields"));
                }
                for (name, spec) in structure {
                    spec.validate(&format!("{}.{}", path, name))?;
                }
                Ok(())
            }
            FieldSpec::Literal { .. } => Ok(()),
        }
    }

    /// Structural equality that, unlike `==`, is sensitive to field order
    fn same_layout(&self, other: &FieldSpec) -> bool {
        match (self, other) {
            (
                FieldSpec::Composite {
                    structure: a,
                    optional: oa,
                },
                FieldSpec::Composite {
                    structure: b,
                    optional: ob,
                },
            ) => oa == ob && same_structure(a, b),
            (a, b) => a == b,
        }
    }
}

fn invalid(path: &str, reason: &str) -> DispatchError {
    DispatchError::invalid_config(format!("field '{}': {}", path, reason))
}

fn same_structure(a: &IndexMap<String, FieldSpec>, b: &IndexMap<String, FieldSpec>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ka, sa), (kb, sb))| ka == kb && sa.same_layout(sb))
}

/// Versioned payload layout for one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDefinition {
    pub name: String,
    pub structure: IndexMap<String, FieldSpec>,
    pub version: u64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl FormatDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::invalid_config("format definition has an empty name"));
        }
        if self.structure.is_empty() {
            return Err(DispatchError::invalid_config(format!(
                "format '{}' has an empty structure",
                self.name
            )));
        }
        for (name, spec) in &self.structure {
            spec.validate(name)
                .map_err(|e| e.with_context(ErrorContext::new().scenario(&self.name)))?;
        }
        Ok(())
    }

    /// Whether two definitions produce the same payload layout
    pub fn same_structure(&self, other: &FormatDefinition) -> bool {
        same_structure(&self.structure, &other.structure)
    }
}

/// Per-request computed results, keyed by data-source name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultBag(IndexMap<String, Value>);

impl ResultBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, value: Value) {
        self.0.insert(source.into(), value);
    }

    pub fn with(mut self, source: impl Into<String>, value: Value) -> Self {
        self.insert(source, value);
        self
    }

    pub fn get(&self, source: &str) -> Option<&Value> {
        self.0.get(source)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for ResultBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Format lookup over one captured snapshot
///
/// Failures carry the scenario and the snapshot version they were resolved
/// against.
#[derive(Debug, Clone, Copy)]
pub struct FormatRegistry<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> FormatRegistry<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn resolve(&self, scenario: &str) -> Result<Arc<FormatDefinition>> {
        self.snapshot.format(scenario).map_err(|e| {
            e.with_context(
                ErrorContext::new()
                    .scenario(scenario)
                    .snapshot_version(self.snapshot.version_id),
            )
        })
    }
}
