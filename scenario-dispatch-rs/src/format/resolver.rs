//! Field Resolver
//!
//! Walks a format definition in declared order and builds the payload from a
//! result bag. Output is a pure function of the two inputs, so identical
//! inputs always give byte-identical payloads.
//!
//! Absence rules:
//! - an optional field whose data is missing is omitted, never emitted as null
//! - a mandatory field whose data is missing fails the composition
//! - a composite is all-or-nothing: a failing sub-field drops the whole
//!   composite when it is optional and fails the composition otherwise
//!
//! A JSON `null` counts as missing.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::{FieldSpec, FormatDefinition, ResultBag};
use crate::error::{DispatchError, ErrorContext, Result};

/// Reason reported when a mandatory field's data source is absent
pub const MISSING_DATA_SOURCE: &str = "missing data source";

/// Ordered payload produced by [`FieldResolver::compose`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ComposedPayload(Value);

impl ComposedPayload {
    fn new(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Top-level keys in output order
    pub fn keys(&self) -> Vec<&str> {
        self.0
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Stateless payload composer
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldResolver;

impl FieldResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(&self, definition: &FormatDefinition, bag: &ResultBag) -> Result<ComposedPayload> {
        let mut payload = Map::new();

        for (name, spec) in &definition.structure {
            match resolve(name, spec, bag) {
                Ok(Some(value)) => {
                    payload.insert(name.clone(), value);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        scenario = %definition.name,
                        format_version = definition.version,
                        error = %err,
                        "Payload composition failed"
                    );
                    return Err(err.with_context(
                        ErrorContext::new()
                            .scenario(&definition.name)
                            .with("format_version", definition.version),
                    ));
                }
            }
        }

        Ok(ComposedPayload::new(payload))
    }
}

/// `Ok(None)` means the field is omitted from the output
fn resolve(path: &str, spec: &FieldSpec, bag: &ResultBag) -> Result<Option<Value>> {
    match spec {
        FieldSpec::Literal { value } => Ok(Some(value.clone())),

        FieldSpec::Result {
            data_source,
            field,
            fields,
            optional,
        } => {
            let Some(source) = bag.get(data_source).filter(|v| !v.is_null()) else {
                return if *optional {
                    Ok(None)
                } else {
                    Err(DispatchError::field_resolution(path, MISSING_DATA_SOURCE)
                        .with_context_value("data_source", data_source))
                };
            };

            if let Some(sub_path) = field {
                return match lookup(source, sub_path) {
                    Some(value) => Ok(Some(value.clone())),
                    None if *optional => Ok(None),
                    None => Err(missing_path(path, data_source, sub_path)),
                };
            }

            if let Some(sub_paths) = fields {
                let mut selected = Map::new();
                for sub_path in sub_paths {
                    match lookup(source, sub_path) {
                        Some(value) => {
                            selected.insert(sub_path.clone(), value.clone());
                        }
                        None if *optional => {}
                        None => return Err(missing_path(path, data_source, sub_path)),
                    }
                }
                return Ok((!selected.is_empty()).then_some(Value::Object(selected)));
            }

            Ok(Some(source.clone()))
        }

        FieldSpec::Composite { structure, optional } => {
            let mut group = Map::new();
            for (name, child) in structure {
                let child_path = format!("{}.{}", path, name);
                match resolve(&child_path, child, bag) {
                    Ok(Some(value)) => {
                        group.insert(name.clone(), value);
                    }
                    Ok(None) => {}
                    Err(err) if *optional && err.kind() == crate::error::ErrorKind::FieldResolution => {
                        tracing::debug!(field = path, error = %err, "Dropping optional composite");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(Some(Value::Object(group)))
        }
    }
}

fn missing_path(path: &str, data_source: &str, sub_path: &str) -> DispatchError {
    DispatchError::field_resolution(path, format!("missing path '{}' in {}", sub_path, data_source))
        .with_context_value("data_source", data_source)
}

/// Follow a dot-separated path; numeric segments index arrays
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}
