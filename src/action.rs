use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::artifact::{Artifact, ArtifactPath};
use crate::exports::ExportName;
use crate::template::{get_att, import_value, join, logical_id, ref_, secret_reference};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_BUILD_IMAGE: &str = "aws/codebuild/standard:5.0";
pub const SOURCE_SUFFIX: &str = "SourceOutput";
pub const BUILD_SUFFIX: &str = "BuildOutput";

/// Coordinates of a repository fetched by the source stage. `credential`
/// names a secret store entry holding the access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_spec: Option<String>,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl RepositoryRef {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: default_branch(),
            credential: credential.into(),
            artifact: None,
            build_spec: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_build_spec(mut self, path: impl Into<String>) -> Self {
        self.build_spec = Some(path.into());
        self
    }

    pub fn artifact_name(&self) -> String {
        self.artifact
            .clone()
            .unwrap_or_else(|| format!("{}{SOURCE_SUFFIX}", logical_id(&[&self.repo])))
    }

    pub fn action_name(&self) -> String {
        format!("{}_Source", artifact_prefix(&self.artifact_name()))
    }
}

/// `CdkSourceOutput` -> `Cdk`. Names without the suffix are their own prefix.
pub fn artifact_prefix(name: &str) -> &str {
    name.strip_suffix(SOURCE_SUFFIX)
        .filter(|p| !p.is_empty())
        .unwrap_or(name)
}

pub fn build_output_name(source: &Artifact) -> String {
    format!("{}{BUILD_SUFFIX}", artifact_prefix(source.name()))
}

pub fn build_action_name(source: &Artifact) -> String {
    format!("{}_Build", artifact_prefix(source.name()))
}

/// `build-specs/<prefix>-build-spec.yml` relative to the built repository.
pub fn conventional_build_spec(source: &Artifact) -> String {
    format!(
        "build-specs/{}-build-spec.yml",
        kebab_case(artifact_prefix(source.name()))
    )
}

/// `ExpressLambdaService` -> `express-lambda-service`; acronym runs stay
/// together (`ABTest` -> `ab-test`, `APIV2` -> `apiv2`).
fn kebab_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' {
            out.push('-');
            continue;
        }
        if c.is_ascii_uppercase() && idx > 0 {
            let prev = chars[idx - 1];
            let next_lower = chars.get(idx + 1).is_some_and(|n| n.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower);
            if boundary && !out.ends_with('-') {
                out.push('-');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInput {
    pub source: Artifact,
    pub build_spec: String,
}

impl BuildInput {
    pub fn new(source: Artifact, build_spec: impl Into<String>) -> Self {
        Self {
            source,
            build_spec: build_spec.into(),
        }
    }

    pub fn conventional(source: Artifact) -> Self {
        let build_spec = conventional_build_spec(&source);
        Self { source, build_spec }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    Import(ExportName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Started,
    Succeeded,
    Failed,
    Abandoned,
    Canceled,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Started => "STARTED",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Abandoned => "ABANDONED",
            ExecutionState::Canceled => "CANCELED",
        }
    }
}

/// JSON path into an execution state-change event, `$.a.b.c` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventField(String);

impl EventField {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn execution_url() -> Self {
        Self::new("$.detail.execution-result.external-execution-url")
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// Placeholder key used by the rendered input transformer.
    pub fn key(&self) -> String {
        self.0
            .trim_start_matches("$.")
            .replace('.', "-")
    }

    pub fn resolve<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        self.0
            .trim_start_matches("$.")
            .split('.')
            .try_fold(event, |node, key| node.get(key))
    }
}

/// Message text followed by a single substituted event field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub text: String,
    pub field: EventField,
}

impl NotificationMessage {
    pub fn integration_test_failed() -> Self {
        Self {
            text: "Integration Test failed. See details here: ".to_string(),
            field: EventField::execution_url(),
        }
    }

    pub fn input_template(&self) -> String {
        format!("\"{}<{}>\"", self.text, self.field.key())
    }

    pub fn render(&self, event: &Value) -> Option<String> {
        let value = self.field.resolve(event)?;
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(format!("{}{}", self.text, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHook {
    pub rule_name: String,
    pub description: String,
    pub state: ExecutionState,
    /// Logical id of the notification topic in the pipeline template.
    pub topic: String,
    pub message: NotificationMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    pub account: Option<String>,
    pub region: Option<String>,
    /// Neither account nor region came from the deployed definition; both
    /// are the pipeline's own.
    pub inherited: bool,
    pub cross_account: bool,
    pub cross_region: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployConfig {
    pub stack_name: String,
    pub template_path: ArtifactPath,
    pub admin_permissions: bool,
    pub parameter_overrides: BTreeMap<String, Value>,
    pub target: DeployTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub build_spec: String,
    pub build_image: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Source {
        owner: String,
        repo: String,
        branch: String,
        credential: String,
    },
    Build(BuildConfig),
    Deploy(DeployConfig),
    Test(BuildConfig),
}

impl ActionKind {
    pub fn category(&self) -> &'static str {
        match self {
            ActionKind::Source { .. } => "Source",
            ActionKind::Build(_) => "Build",
            ActionKind::Deploy(_) => "Deploy",
            ActionKind::Test(_) => "Test",
        }
    }

    fn type_id(&self) -> Value {
        let (owner, provider) = match self {
            ActionKind::Source { .. } => ("ThirdParty", "GitHub"),
            ActionKind::Build(_) | ActionKind::Test(_) => ("AWS", "CodeBuild"),
            ActionKind::Deploy(_) => ("AWS", "CloudFormation"),
        };
        json!({
            "Category": self.category(),
            "Owner": owner,
            "Provider": provider,
            "Version": "1",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub run_order: u32,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
    pub environment: BTreeMap<String, EnvValue>,
    pub hooks: Vec<EventHook>,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            run_order: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            environment: BTreeMap::new(),
            hooks: Vec::new(),
            kind,
        }
    }

    pub fn with_run_order(mut self, run_order: u32) -> Self {
        self.run_order = run_order;
        self
    }

    pub fn with_input(mut self, artifact: Artifact) -> Self {
        self.inputs.push(artifact);
        self
    }

    pub fn with_output(mut self, artifact: Artifact) -> Self {
        self.outputs.push(artifact);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: EnvValue) -> Self {
        self.environment.insert(key.into(), value);
        self
    }

    pub fn with_hook(mut self, hook: EventHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn deploy_config(&self) -> Option<&DeployConfig> {
        match &self.kind {
            ActionKind::Deploy(config) => Some(config),
            _ => None,
        }
    }

    pub fn build_config(&self) -> Option<&BuildConfig> {
        match &self.kind {
            ActionKind::Build(config) | ActionKind::Test(config) => Some(config),
            _ => None,
        }
    }

    /// Renders the action as a pipeline stage entry. `project` is the
    /// logical id of the build project backing build and test actions;
    /// `deploy_role` the role assumed by provisioning updates.
    pub fn render(&self, project: Option<&str>, deploy_role: &str) -> Value {
        let configuration = match &self.kind {
            ActionKind::Source {
                owner,
                repo,
                branch,
                credential,
            } => json!({
                "Owner": owner,
                "Repo": repo,
                "Branch": branch,
                "OAuthToken": secret_reference(credential),
                "PollForSourceChanges": false,
            }),
            ActionKind::Build(_) | ActionKind::Test(_) => {
                let mut config = json!({
                    "ProjectName": project.map(ref_).unwrap_or(Value::Null),
                });
                if !self.environment.is_empty() {
                    config["EnvironmentVariables"] = render_environment(&self.environment);
                }
                config
            }
            ActionKind::Deploy(deploy) => {
                let overrides = serde_json::to_string(&deploy.parameter_overrides)
                    .unwrap_or_else(|_| "{}".to_string());
                let mut config = json!({
                    "ActionMode": "CREATE_UPDATE",
                    "StackName": deploy.stack_name,
                    "TemplatePath": deploy.template_path.render(),
                    "Capabilities": "CAPABILITY_NAMED_IAM",
                    "RoleArn": get_att(deploy_role, "Arn"),
                });
                if deploy.admin_permissions {
                    config["Capabilities"] =
                        Value::String("CAPABILITY_NAMED_IAM,CAPABILITY_AUTO_EXPAND".into());
                }
                if !deploy.parameter_overrides.is_empty() {
                    config["ParameterOverrides"] = Value::String(overrides);
                }
                config
            }
        };

        let mut rendered = json!({
            "Name": self.name,
            "ActionTypeId": self.kind.type_id(),
            "Configuration": configuration,
            "RunOrder": self.run_order,
        });
        if !self.inputs.is_empty() {
            rendered["InputArtifacts"] = artifact_list(&self.inputs);
        }
        if !self.outputs.is_empty() {
            rendered["OutputArtifacts"] = artifact_list(&self.outputs);
        }
        if let ActionKind::Deploy(deploy) = &self.kind {
            let target = &deploy.target;
            if target.cross_region
                && let Some(region) = &target.region
            {
                rendered["Region"] = Value::String(region.clone());
            }
            if target.cross_account
                && let Some(account) = &target.account
            {
                let region = target.region.as_deref().unwrap_or("${AWS::Region}");
                rendered["RoleArn"] = json!({
                    "Fn::Sub": format!(
                        "arn:${{AWS::Partition}}:iam::{account}:role/cdk-hnb659fds-deploy-role-{account}-{region}"
                    )
                });
            }
        }
        rendered
    }
}

fn artifact_list(artifacts: &[Artifact]) -> Value {
    Value::Array(
        artifacts
            .iter()
            .map(|a| json!({ "Name": a.name() }))
            .collect(),
    )
}

/// Build environment variables are passed as a JSON string. Imported values
/// are spliced in with `Fn::Join` so they resolve at deploy time.
pub fn render_environment(environment: &BTreeMap<String, EnvValue>) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    let mut buffer = String::from("[");
    for (idx, (name, value)) in environment.iter().enumerate() {
        if idx > 0 {
            buffer.push(',');
        }
        buffer.push_str(&format!(
            "{{\"name\":{},\"type\":\"PLAINTEXT\",\"value\":",
            Value::String(name.clone())
        ));
        match value {
            EnvValue::Literal(literal) => {
                buffer.push_str(&Value::String(literal.clone()).to_string());
            }
            EnvValue::Import(export) => {
                buffer.push('"');
                parts.push(Value::String(std::mem::take(&mut buffer)));
                parts.push(import_value(export.as_str()));
                buffer.push('"');
            }
        }
        buffer.push('}');
    }
    buffer.push(']');

    if parts.is_empty() {
        return Value::String(buffer);
    }
    parts.push(Value::String(buffer));
    join("", parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names_follow_source_artifact() {
        let source = Artifact::new("CdkSourceOutput");
        assert_eq!(build_output_name(&source), "CdkBuildOutput");
        assert_eq!(build_action_name(&source), "Cdk_Build");
        assert_eq!(conventional_build_spec(&source), "build-specs/cdk-build-spec.yml");

        let repo = RepositoryRef::new("owner", "express-lambda-service", "token");
        assert_eq!(repo.artifact_name(), "ExpressLambdaServiceSourceOutput");
        assert_eq!(repo.action_name(), "ExpressLambdaService_Source");
        assert_eq!(
            conventional_build_spec(&Artifact::new(repo.artifact_name())),
            "build-specs/express-lambda-service-build-spec.yml"
        );
    }

    #[test]
    fn kebab_case_keeps_acronyms_together() {
        assert_eq!(kebab_case("Cdk"), "cdk");
        assert_eq!(kebab_case("ExpressLambdaService"), "express-lambda-service");
        assert_eq!(kebab_case("ABTest"), "ab-test");
        assert_eq!(kebab_case("MyAPIService"), "my-api-service");
        assert_eq!(kebab_case("APIV2"), "apiv2");
        assert_eq!(kebab_case("Service2Api"), "service2-api");
        assert_eq!(kebab_case("Pipeline_Update"), "pipeline-update");
    }

    #[test]
    fn literal_environment_renders_as_plain_string() {
        let mut env = BTreeMap::new();
        env.insert(
            "SERVICE_ENDPOINT".to_string(),
            EnvValue::Literal("https://svc.test".into()),
        );
        assert_eq!(
            render_environment(&env),
            Value::String(
                r#"[{"name":"SERVICE_ENDPOINT","type":"PLAINTEXT","value":"https://svc.test"}]"#
                    .into()
            )
        );
    }

    #[test]
    fn imported_environment_is_joined() {
        let mut env = BTreeMap::new();
        env.insert(
            "SERVICE_ENDPOINT".to_string(),
            EnvValue::Import(ExportName::service_endpoint("Test")),
        );
        let rendered = render_environment(&env);
        let parts = rendered["Fn::Join"][1].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], import_value("ServiceEndpointTest"));
        assert_eq!(parts[2], Value::String("\"}]".into()));
    }

    #[test]
    fn failure_message_substitutes_execution_url() {
        let message = NotificationMessage::integration_test_failed();
        let event = json!({
            "detail": { "execution-result": { "external-execution-url": "https://console/run/1" } }
        });
        assert_eq!(
            message.render(&event).as_deref(),
            Some("Integration Test failed. See details here: https://console/run/1")
        );
        assert_eq!(
            message.input_template(),
            "\"Integration Test failed. See details here: <detail-execution-result-external-execution-url>\""
        );
    }
}
