//! Declarative template model handed to the external provisioning engine.
//!
//! Templates are plain data: rendering never depends on values that only
//! exist after a deployment. Cross-stack values travel through
//! `Fn::ImportValue`, resolved later by [`crate::exports::DeploymentLedger`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const FORMAT_VERSION: &str = "2010-09-09";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<Value>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
            depends_on: Vec::new(),
            update_policy: None,
        }
    }

    pub fn with_update_policy(mut self, policy: Value) -> Self {
        self.update_policy = Some(policy);
        self
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: String,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: Some(description.into()),
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add_parameter(&mut self, id: impl Into<String>, description: impl Into<String>) {
        self.parameters.insert(
            id.into(),
            Parameter {
                kind: "String".to_string(),
                description: Some(description.into()),
            },
        );
    }

    pub fn add_resource(&mut self, id: impl Into<String>, resource: Resource) {
        self.resources.insert(id.into(), resource);
    }

    pub fn add_output(&mut self, id: impl Into<String>, output: Output) {
        self.outputs.insert(id.into(), output);
    }

    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources_of_type<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources.iter().filter(move |(_, r)| r.kind == kind)
    }

    pub fn has_resource_type(&self, kind: &str) -> bool {
        self.resources_of_type(kind).next().is_some()
    }

    /// Names of every export this template publishes.
    pub fn export_names(&self) -> Vec<&str> {
        self.outputs
            .values()
            .filter_map(|o| o.export.as_ref().map(|e| e.name.as_str()))
            .collect()
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn ref_(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

pub fn import_value(export_name: &str) -> Value {
    json!({ "Fn::ImportValue": export_name })
}

pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

pub fn get_artifact_att(artifact: &str, attribute: &str) -> Value {
    json!({ "Fn::GetArtifactAtt": [artifact, attribute] })
}

/// Dynamic reference to a secret store entry. The secret itself never
/// appears in a rendered template.
pub fn secret_reference(handle: &str) -> Value {
    Value::String(format!("{{{{resolve:secretsmanager:{handle}:SecretString:::}}}}"))
}

/// Collapses an arbitrary name into a CloudFormation logical id
/// (`Pipeline_Update` -> `PipelineUpdate`, `service-canary` -> `ServiceCanary`).
pub fn logical_id(parts: &[&str]) -> String {
    let mut id = String::new();
    for part in parts {
        for segment in part.split(|c: char| !c.is_ascii_alphanumeric()) {
            let mut chars = segment.chars();
            if let Some(first) = chars.next() {
                id.push(first.to_ascii_uppercase());
                id.extend(chars);
            }
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_ids_drop_separators() {
        assert_eq!(logical_id(&["Pipeline_Update"]), "PipelineUpdate");
        assert_eq!(logical_id(&["service-canary", "Alarm"]), "ServiceCanaryAlarm");
        assert_eq!(logical_id(&["Prod", "Integration_Test"]), "ProdIntegrationTest");
    }

    #[test]
    fn secret_reference_uses_dynamic_reference_syntax() {
        assert_eq!(
            secret_reference("github-token"),
            Value::String("{{resolve:secretsmanager:github-token:SecretString:::}}".into())
        );
    }

    #[test]
    fn serialized_template_uses_cloudformation_keys() {
        let mut template = Template::new("demo");
        template.add_resource("Topic", Resource::new("AWS::SNS::Topic", json!({})));
        let value = template.to_value().unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], FORMAT_VERSION);
        assert_eq!(value["Resources"]["Topic"]["Type"], "AWS::SNS::Topic");
        assert!(value.get("Outputs").is_none());
    }
}
