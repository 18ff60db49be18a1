//! Export/import plumbing between separately deployed stacks.
//!
//! Phase 1 renders every template once, before anything is deployed, so a
//! value produced by a stack can only be consumed elsewhere by export name.
//! Phase 2 happens after deployment: the ledger records what each stack
//! exported and substitutes `Fn::ImportValue` references.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::template::Template;

pub const SERVICE_ENDPOINT_EXPORT_PREFIX: &str = "ServiceEndpoint";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportName(String);

impl ExportName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `ServiceEndpoint<Label>`; labels are case-sensitive.
    pub fn service_endpoint(label: &str) -> Self {
        Self(format!("{SERVICE_ENDPOINT_EXPORT_PREFIX}{label}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value handed to an action that needs a service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointValue {
    Literal(String),
    Import(ExportName),
    /// Direct reference to another stack's output. Never renderable across
    /// stacks; the composer rejects it.
    Output { stack: String, output: String },
}

impl From<&str> for EndpointValue {
    fn from(value: &str) -> Self {
        EndpointValue::Literal(value.to_string())
    }
}

impl From<String> for EndpointValue {
    fn from(value: String) -> Self {
        EndpointValue::Literal(value)
    }
}

impl From<ExportName> for EndpointValue {
    fn from(value: ExportName) -> Self {
        EndpointValue::Import(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    #[error("export '{name}' is already published by stack '{owner}' (redeclared by '{stack}')")]
    DuplicateExport {
        name: String,
        owner: String,
        stack: String,
    },

    #[error("no deployed stack exports '{0}'")]
    UnresolvedImport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExportedValue {
    stack: String,
    value: String,
}

/// Exports published by deployed stacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentLedger {
    exports: BTreeMap<String, ExportedValue>,
}

impl DeploymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ledger from a flat `export name -> value` map, as written by
    /// a deployment tool after the stacks are up.
    pub fn from_values(stack: &str, values: BTreeMap<String, String>) -> Result<Self, ExportError> {
        let mut ledger = Self::new();
        for (name, value) in values {
            ledger.publish(stack, ExportName::new(name), value)?;
        }
        Ok(ledger)
    }

    pub fn publish(
        &mut self,
        stack: &str,
        name: ExportName,
        value: impl Into<String>,
    ) -> Result<(), ExportError> {
        if let Some(existing) = self.exports.get(name.as_str())
            && existing.stack != stack
        {
            return Err(ExportError::DuplicateExport {
                name: name.0,
                owner: existing.stack.clone(),
                stack: stack.to_string(),
            });
        }
        debug!(stack, export = name.as_str(), "Export recorded");
        self.exports.insert(
            name.0,
            ExportedValue {
                stack: stack.to_string(),
                value: value.into(),
            },
        );
        Ok(())
    }

    /// Records the deployed values of every exported output of `template`.
    /// `outputs` maps output logical ids to their deployed values.
    pub fn record(
        &mut self,
        stack: &str,
        template: &Template,
        outputs: &BTreeMap<String, String>,
    ) -> Result<usize, ExportError> {
        let mut recorded = 0;
        for (id, output) in &template.outputs {
            let (Some(export), Some(value)) = (&output.export, outputs.get(id)) else {
                continue;
            };
            self.publish(stack, ExportName::new(export.name.clone()), value.clone())?;
            recorded += 1;
        }
        Ok(recorded)
    }

    pub fn lookup(&self, name: &ExportName) -> Option<&str> {
        self.exports.get(name.as_str()).map(|e| e.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Returns a copy of `value` with every `{"Fn::ImportValue": name}`
    /// replaced by the exported string.
    pub fn resolve(&self, value: &Value) -> Result<Value, ExportError> {
        match value {
            Value::Object(map) => {
                if map.len() == 1
                    && let Some(Value::String(name)) = map.get("Fn::ImportValue")
                {
                    return self
                        .lookup(&ExportName::new(name.clone()))
                        .map(|v| Value::String(v.to_string()))
                        .ok_or_else(|| ExportError::UnresolvedImport(name.clone()));
                }
                let mut resolved = Map::with_capacity(map.len());
                for (key, inner) in map {
                    resolved.insert(key.clone(), self.resolve(inner)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

/// Every export name imported anywhere inside `value`.
pub fn imported_names(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_imports(value, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_imports(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get("Fn::ImportValue") {
                names.push(name.clone());
            }
            for inner in map.values() {
                collect_imports(inner, names);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_imports(item, names)),
        _ => {}
    }
}
