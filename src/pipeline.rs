//! Pipeline composition: an ordered list of stages assembled by a single
//! composition pass and rendered once into a deployable template.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};

use crate::action::{
    Action, ActionKind, BuildConfig, BuildInput, DEFAULT_BUILD_IMAGE, DeployConfig, DeployTarget,
    EnvValue, EventHook, ExecutionState, NotificationMessage, RepositoryRef, build_action_name,
    build_output_name,
};
use crate::artifact::{Artifact, ArtifactRegistry, Producer};
use crate::billing::BillingDefinition;
use crate::error::{CompositionError, Result};
use crate::exports::{EndpointValue, ExportName};
use crate::service::{PRODUCTION_LABEL, ServiceDefinition};
use crate::template::{Resource, Template, get_att, join, logical_id, ref_};

pub const SOURCE_STAGE: &str = "Source";
pub const BUILD_STAGE: &str = "Build";
pub const SELF_UPDATE_STAGE: &str = "Pipeline_Update";
pub const SELF_UPDATE_ACTION: &str = "Pipeline_Update";
pub const SERVICE_UPDATE_ACTION: &str = "Service_Update";
pub const BILLING_UPDATE_ACTION: &str = "Billing_Update";
pub const INTEGRATION_TEST_ACTION: &str = "Integration_Test";
pub const INTEGRATION_TEST_BUILD_SPEC: &str = "build-specs/integ-test-build-spec.yml";
pub const SERVICE_ENDPOINT_VARIABLE: &str = "SERVICE_ENDPOINT";
pub const NOTIFICATION_TOPIC: &str = "PipelineNotificationsTopic";
pub const NOTIFICATION_TOPIC_NAME: &str = "PipelineNotifications";
const DEPLOY_ROLE: &str = "PipelineDeployRole";
const PIPELINE_ROLE: &str = "PipelineRole";
const BUILD_ROLE: &str = "PipelineBuildRole";
const ARTIFACTS_BUCKET: &str = "ArtifactsBucket";
const PIPELINE: &str = "Pipeline";
const REGION_BUCKET_PARAMETER: &str = "ArtifactsBucket";

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// `us-west-2` -> `ArtifactsBucketUsWest2`.
pub fn region_bucket_parameter(region: &str) -> String {
    logical_id(&[REGION_BUCKET_PARAMETER, region])
}

fn default_name() -> String {
    "Pipeline".to_string()
}

fn default_stack_name() -> String {
    "PipelineStack".to_string()
}

fn default_build_image() -> String {
    DEFAULT_BUILD_IMAGE.to_string()
}

fn default_production_label() -> String {
    PRODUCTION_LABEL.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_stack_name")]
    pub stack_name: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default = "default_build_image")]
    pub build_image: String,
    #[serde(default = "default_production_label")]
    pub production_label: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::new(default_name())
    }
}

impl PipelineSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_name: default_stack_name(),
            account: None,
            region: None,
            notification_email: None,
            build_image: default_build_image(),
            production_label: default_production_label(),
        }
    }

    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.stack_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComposerState {
    Empty,
    SourceAdded,
    BuildAdded,
    SelfUpdateAdded,
    ServiceStagesAdded,
    Finalized,
}

/// Opaque reference to a stage of the pipeline that created it. Handles
/// from another composer are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle {
    pipeline: u64,
    index: usize,
}

impl StageHandle {
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn max_run_order(&self) -> u32 {
        self.actions.iter().map(|a| a.run_order).max().unwrap_or(0)
    }

    fn check_action_name(&self, name: &str) -> Result<()> {
        if self.action(name).is_some() {
            return Err(CompositionError::duplicate("action", name));
        }
        Ok(())
    }
}

/// Actions sharing a run-order; the engine runs them concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    pub run_order: u32,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub waves: Vec<Wave>,
}

#[derive(Debug, Clone)]
struct PublishedExport {
    stage: usize,
    run_order: u32,
    /// Set when the exporting stack lives outside the pipeline's region.
    remote_region: Option<String>,
}

/// Composition session for one pipeline. Owns its stage list exclusively;
/// every operation validates first and mutates only on success.
#[derive(Debug, Clone)]
pub struct PipelineComposer {
    id: u64,
    settings: PipelineSettings,
    stages: Vec<Stage>,
    service_stages: HashSet<usize>,
    artifacts: ArtifactRegistry,
    state: ComposerState,
    build_specs: HashMap<String, String>,
    definition_source: Option<Artifact>,
    service_source: Option<Artifact>,
    definition_build: Option<Artifact>,
    service_build: Option<Artifact>,
    exports: HashMap<String, PublishedExport>,
}

impl PipelineComposer {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            stages: Vec::new(),
            service_stages: HashSet::new(),
            artifacts: ArtifactRegistry::new(),
            state: ComposerState::Empty,
            build_specs: HashMap::new(),
            definition_source: None,
            service_source: None,
            definition_build: None,
            service_build: None,
            exports: HashMap::new(),
        }
    }

    pub fn initialize(name: impl Into<String>) -> Self {
        Self::new(PipelineSettings::new(name))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn state(&self) -> ComposerState {
        self.state
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, handle: StageHandle) -> Option<&Stage> {
        if handle.pipeline != self.id {
            return None;
        }
        self.stages.get(handle.index)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<StageHandle> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .map(|index| self.handle(index))
    }

    fn handle(&self, index: usize) -> StageHandle {
        StageHandle {
            pipeline: self.id,
            index,
        }
    }

    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.artifacts
    }

    pub fn published_exports(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.state == ComposerState::Finalized {
            return Err(CompositionError::Finalized(self.settings.name.clone()));
        }
        Ok(())
    }

    fn require_state(&self, operation: &'static str, allowed: &[ComposerState]) -> Result<()> {
        self.ensure_mutable()?;
        if !allowed.contains(&self.state) {
            return Err(CompositionError::OutOfOrder {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Stage names seed resource ids, so two names that only differ in
    /// separators (`Prod-1`, `Prod1`) count as duplicates.
    fn check_stage_name(&self, name: &str) -> Result<()> {
        let id = logical_id(&[name]);
        if id.is_empty() {
            return Err(CompositionError::InvalidReference(format!(
                "stage name '{name}' has no alphanumeric characters"
            )));
        }
        if self
            .stages
            .iter()
            .any(|s| s.name == name || logical_id(&[&s.name]) == id)
        {
            return Err(CompositionError::duplicate("stage", name));
        }
        Ok(())
    }

    fn stage_index(&self, handle: StageHandle) -> Result<usize> {
        if handle.pipeline == self.id && handle.index < self.stages.len() {
            Ok(handle.index)
        } else {
            Err(CompositionError::UnknownStage(handle.index))
        }
    }

    /// Billing and integration tests only ever join a service stage.
    fn service_stage_index(&self, handle: StageHandle) -> Result<usize> {
        let index = self.stage_index(handle)?;
        if !self.service_stages.contains(&index) {
            return Err(CompositionError::InvalidReference(format!(
                "stage '{}' is not a service stage",
                self.stages[index].name
            )));
        }
        Ok(index)
    }

    fn home_target(&self) -> DeployTarget {
        DeployTarget {
            account: self.settings.account.clone(),
            region: self.settings.region.clone(),
            inherited: true,
            cross_account: false,
            cross_region: false,
        }
    }

    /// Account and region of a service deployment. Values the service does
    /// not set fall back to the pipeline's own.
    fn service_target(&self, service: &ServiceDefinition) -> DeployTarget {
        let account = service
            .account()
            .map(str::to_string)
            .or_else(|| self.settings.account.clone());
        let region = service
            .region()
            .map(str::to_string)
            .or_else(|| self.settings.region.clone());
        let inherited = service.account().is_none() && service.region().is_none();
        if inherited {
            debug!(
                service = service.label(),
                "Service has no account/region; using the pipeline's own"
            );
        }
        DeployTarget {
            cross_account: service.account().is_some() && account != self.settings.account,
            cross_region: service.region().is_some() && region != self.settings.region,
            account,
            region,
            inherited,
        }
    }

    /// Appends the `Source` stage. The first repository is the pipeline's
    /// own definition; the second (or the first, when alone) holds the
    /// service code.
    #[instrument(skip(self, repos), fields(pipeline = %self.settings.name))]
    pub fn add_source_stage(&mut self, repos: &[RepositoryRef]) -> Result<Vec<Artifact>> {
        self.require_state("add a source stage", &[ComposerState::Empty])?;
        if repos.is_empty() {
            return Err(CompositionError::EmptyInput("source stage"));
        }
        self.check_stage_name(SOURCE_STAGE)?;

        let stage_index = self.stages.len();
        let mut stage = Stage::new(SOURCE_STAGE);
        let mut seen = HashSet::new();
        for repo in repos {
            if repo.credential.trim().is_empty() {
                return Err(CompositionError::InvalidReference(format!(
                    "repository '{}/{}' has an empty credential handle",
                    repo.owner, repo.repo
                )));
            }
            let artifact = Artifact::new(repo.artifact_name());
            if !seen.insert(artifact.clone()) {
                return Err(CompositionError::duplicate("artifact", artifact.name()));
            }
            self.artifacts.check_output(&artifact)?;
            let action_name = repo.action_name();
            stage.check_action_name(&action_name)?;
            stage.actions.push(
                Action::new(
                    action_name,
                    ActionKind::Source {
                        owner: repo.owner.clone(),
                        repo: repo.repo.clone(),
                        branch: repo.branch.clone(),
                        credential: repo.credential.clone(),
                    },
                )
                .with_output(artifact),
            );
        }

        let mut outputs = Vec::with_capacity(repos.len());
        for (repo, action) in repos.iter().zip(&stage.actions) {
            let artifact = action.outputs[0].clone();
            self.artifacts.record(
                &artifact,
                Producer {
                    stage: stage_index,
                    action: action.name.clone(),
                    run_order: action.run_order,
                },
            )?;
            if let Some(spec) = &repo.build_spec {
                self.build_specs
                    .insert(artifact.name().to_string(), spec.clone());
            }
            outputs.push(artifact);
        }

        self.definition_source = outputs.first().cloned();
        self.service_source = outputs.get(1).or(outputs.first()).cloned();
        self.stages.push(stage);
        self.state = ComposerState::SourceAdded;
        info!(sources = outputs.len(), "Source stage added");
        Ok(outputs)
    }

    /// Appends the `Build` stage with one build per source artifact, using
    /// the build spec declared on the repository or the conventional path.
    pub fn add_build_stage(&mut self, sources: &[Artifact]) -> Result<Vec<Artifact>> {
        let inputs: Vec<BuildInput> = sources
            .iter()
            .map(|source| match self.build_specs.get(source.name()) {
                Some(spec) => BuildInput::new(source.clone(), spec.clone()),
                None => BuildInput::conventional(source.clone()),
            })
            .collect();
        self.add_build_stage_with(&inputs)
    }

    #[instrument(skip(self, inputs), fields(pipeline = %self.settings.name))]
    pub fn add_build_stage_with(&mut self, inputs: &[BuildInput]) -> Result<Vec<Artifact>> {
        self.require_state("add a build stage", &[ComposerState::SourceAdded])?;
        if inputs.is_empty() {
            return Err(CompositionError::EmptyInput("build stage"));
        }
        self.check_stage_name(BUILD_STAGE)?;

        let stage_index = self.stages.len();
        let mut stage = Stage::new(BUILD_STAGE);
        let mut seen = HashSet::new();
        for input in inputs {
            let action_name = build_action_name(&input.source);
            self.artifacts
                .check_input(&input.source, &action_name, stage_index, 1)?;
            let output = Artifact::new(build_output_name(&input.source));
            if !seen.insert(output.clone()) {
                return Err(CompositionError::duplicate("artifact", output.name()));
            }
            self.artifacts.check_output(&output)?;
            stage.check_action_name(&action_name)?;
            stage.actions.push(
                Action::new(
                    action_name,
                    ActionKind::Build(BuildConfig {
                        build_spec: input.build_spec.clone(),
                        build_image: self.settings.build_image.clone(),
                    }),
                )
                .with_input(input.source.clone())
                .with_output(output),
            );
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for (input, action) in inputs.iter().zip(&stage.actions) {
            let output = action.outputs[0].clone();
            self.artifacts.record(
                &output,
                Producer {
                    stage: stage_index,
                    action: action.name.clone(),
                    run_order: action.run_order,
                },
            )?;
            if self.definition_source.as_ref() == Some(&input.source) {
                self.definition_build = Some(output.clone());
            }
            if self.service_source.as_ref() == Some(&input.source) {
                self.service_build = Some(output.clone());
            }
            outputs.push(output);
        }

        self.stages.push(stage);
        self.state = ComposerState::BuildAdded;
        info!(builds = outputs.len(), "Build stage added");
        Ok(outputs)
    }

    /// Appends the stage that redeploys the pipeline's own template from its
    /// build output. Must come right after the build stage.
    #[instrument(skip(self), fields(pipeline = %self.settings.name))]
    pub fn add_self_update_stage(&mut self) -> Result<StageHandle> {
        self.require_state("add the self-update stage", &[ComposerState::BuildAdded])?;
        self.check_stage_name(SELF_UPDATE_STAGE)?;
        let stage_index = self.stages.len();
        let definition = required_build(
            &self.definition_build,
            &self.definition_source,
            SELF_UPDATE_ACTION,
        )?;
        self.artifacts
            .check_input(&definition, SELF_UPDATE_ACTION, stage_index, 1)?;

        let mut stage = Stage::new(SELF_UPDATE_STAGE);
        stage.actions.push(
            Action::new(
                SELF_UPDATE_ACTION,
                ActionKind::Deploy(DeployConfig {
                    stack_name: self.settings.stack_name.clone(),
                    template_path: definition.at_path(self.settings.template_file()),
                    admin_permissions: true,
                    parameter_overrides: Default::default(),
                    target: self.home_target(),
                }),
            )
            .with_input(definition),
        );
        self.stages.push(stage);
        self.state = ComposerState::SelfUpdateAdded;
        info!("Self-update stage added");
        Ok(self.handle(stage_index))
    }

    /// Appends a stage deploying `service`, with its code parameters bound to
    /// the service build output.
    #[instrument(skip(self, service), fields(pipeline = %self.settings.name, service = service.label()))]
    pub fn add_service_stage(
        &mut self,
        service: &ServiceDefinition,
        label: &str,
    ) -> Result<StageHandle> {
        self.require_state(
            "add a service stage",
            &[
                ComposerState::BuildAdded,
                ComposerState::SelfUpdateAdded,
                ComposerState::ServiceStagesAdded,
            ],
        )?;
        if label.trim().is_empty() {
            return Err(CompositionError::EmptyInput("service stage label"));
        }
        self.check_stage_name(label)?;

        let stage_index = self.stages.len();
        let definition = required_build(
            &self.definition_build,
            &self.definition_source,
            SERVICE_UPDATE_ACTION,
        )?;
        let code = required_build(
            &self.service_build,
            &self.service_source,
            SERVICE_UPDATE_ACTION,
        )?;
        self.artifacts
            .check_input(&definition, SERVICE_UPDATE_ACTION, stage_index, 1)?;
        self.artifacts
            .check_input(&code, SERVICE_UPDATE_ACTION, stage_index, 1)?;

        let export = service.endpoint_export_name();
        if self.exports.contains_key(export.as_str()) {
            return Err(CompositionError::duplicate("export", export.as_str()));
        }

        let target = self.service_target(service);
        let remote_region = if target.cross_region {
            target.region.clone()
        } else {
            None
        };
        let mut action = Action::new(
            SERVICE_UPDATE_ACTION,
            ActionKind::Deploy(DeployConfig {
                stack_name: service.stack_name().to_string(),
                template_path: definition.at_path(service.template_file()),
                admin_permissions: true,
                parameter_overrides: service.resolve(&code.location()),
                target,
            }),
        )
        .with_input(definition);
        if !action.inputs.contains(&code) {
            action = action.with_input(code);
        }

        let mut stage = Stage::new(label);
        let run_order = action.run_order;
        stage.actions.push(action);
        self.stages.push(stage);
        self.exports.insert(
            export.as_str().to_string(),
            PublishedExport {
                stage: stage_index,
                run_order,
                remote_region,
            },
        );
        self.service_stages.insert(stage_index);
        self.state = ComposerState::ServiceStagesAdded;
        info!(
            stage = label,
            production = service.environment().is_production(),
            "Service stage added"
        );
        Ok(self.handle(stage_index))
    }

    /// Appends the billing stack deployment to an existing stage.
    #[instrument(skip(self, billing), fields(pipeline = %self.settings.name))]
    pub fn add_billing_stack_to_stage(
        &mut self,
        billing: &BillingDefinition,
        handle: StageHandle,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let stage_index = self.service_stage_index(handle)?;
        let definition = required_build(
            &self.definition_build,
            &self.definition_source,
            BILLING_UPDATE_ACTION,
        )?;
        self.artifacts
            .check_input(&definition, BILLING_UPDATE_ACTION, stage_index, 1)?;
        self.stages[stage_index].check_action_name(BILLING_UPDATE_ACTION)?;

        let action = Action::new(
            BILLING_UPDATE_ACTION,
            ActionKind::Deploy(DeployConfig {
                stack_name: billing.stack_name().to_string(),
                template_path: definition.at_path(billing.template_file()),
                admin_permissions: true,
                parameter_overrides: Default::default(),
                target: self.home_target(),
            }),
        )
        .with_input(definition);
        let stage = &mut self.stages[stage_index];
        stage.actions.push(action);
        info!(stage = stage.name.as_str(), "Billing stack attached");
        Ok(())
    }

    /// Appends an integration test that runs after everything else in the
    /// stage and notifies the pipeline topic when it fails.
    #[instrument(skip(self, endpoint), fields(pipeline = %self.settings.name))]
    pub fn add_service_integration_test_to_stage(
        &mut self,
        handle: StageHandle,
        endpoint: impl Into<EndpointValue>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let stage_index = self.service_stage_index(handle)?;
        let stage = &self.stages[stage_index];
        stage.check_action_name(INTEGRATION_TEST_ACTION)?;
        let run_order = stage.max_run_order() + 1;

        let value = match endpoint.into() {
            EndpointValue::Literal(literal) => EnvValue::Literal(literal),
            EndpointValue::Import(name) => {
                self.check_import(&name, stage_index, run_order)?;
                EnvValue::Import(name)
            }
            EndpointValue::Output { stack, output } => {
                return Err(CompositionError::CrossStageReference { stack, output });
            }
        };

        let source = self
            .service_source
            .clone()
            .ok_or(CompositionError::EmptyInput("source stage"))?;
        self.artifacts
            .check_input(&source, INTEGRATION_TEST_ACTION, stage_index, run_order)?;

        let hook = EventHook {
            rule_name: format!("{}IntegrationTestFailed", logical_id(&[&stage.name])),
            description: "Integration test has failed".to_string(),
            state: ExecutionState::Failed,
            topic: NOTIFICATION_TOPIC.to_string(),
            message: NotificationMessage::integration_test_failed(),
        };
        let action = Action::new(
            INTEGRATION_TEST_ACTION,
            ActionKind::Test(BuildConfig {
                build_spec: INTEGRATION_TEST_BUILD_SPEC.to_string(),
                build_image: self.settings.build_image.clone(),
            }),
        )
        .with_run_order(run_order)
        .with_input(source)
        .with_env(SERVICE_ENDPOINT_VARIABLE, value)
        .with_hook(hook);

        let stage = &mut self.stages[stage_index];
        stage.actions.push(action);
        info!(
            stage = stage.name.as_str(),
            run_order, "Integration test attached"
        );
        Ok(())
    }

    /// Imports resolve at deploy time, so the exporting stack must be
    /// deployed before the importing action starts.
    /// Exports are region-scoped: only stacks in the pipeline's region can
    /// be imported by its actions.
    fn check_import(&self, name: &ExportName, stage: usize, run_order: u32) -> Result<()> {
        match self.exports.get(name.as_str()) {
            Some(published)
                if published.stage < stage
                    || (published.stage == stage && published.run_order < run_order) =>
            {
                match &published.remote_region {
                    Some(region) => Err(CompositionError::CrossRegionImport {
                        export: name.to_string(),
                        region: region.clone(),
                    }),
                    None => Ok(()),
                }
            }
            _ => Err(CompositionError::UnpublishedExport(name.to_string())),
        }
    }

    /// Regions other than the pipeline's own that some action deploys to.
    pub fn remote_regions(&self) -> BTreeSet<&str> {
        self.stages
            .iter()
            .flat_map(|s| &s.actions)
            .filter_map(|a| a.deploy_config())
            .filter(|deploy| deploy.target.cross_region)
            .filter_map(|deploy| deploy.target.region.as_deref())
            .collect()
    }

    /// Run-order waves per stage, in execution order.
    pub fn execution_plan(&self) -> Vec<StagePlan> {
        self.stages
            .iter()
            .map(|stage| {
                let mut orders: Vec<u32> = stage.actions.iter().map(|a| a.run_order).collect();
                orders.sort_unstable();
                orders.dedup();
                let waves = orders
                    .into_iter()
                    .map(|run_order| Wave {
                        run_order,
                        actions: stage
                            .actions
                            .iter()
                            .filter(|a| a.run_order == run_order)
                            .map(|a| a.name.clone())
                            .collect(),
                    })
                    .collect();
                StagePlan {
                    name: stage.name.clone(),
                    waves,
                }
            })
            .collect()
    }

    /// Renders the pipeline template and seals the composer.
    #[instrument(skip(self), fields(pipeline = %self.settings.name))]
    pub fn finalize(&mut self) -> Result<Template> {
        self.require_state(
            "finalize",
            &[
                ComposerState::BuildAdded,
                ComposerState::SelfUpdateAdded,
                ComposerState::ServiceStagesAdded,
            ],
        )?;
        let template = self.render();
        self.state = ComposerState::Finalized;
        info!(
            stages = self.stages.len(),
            actions = self.action_count(),
            "Pipeline finalized"
        );
        Ok(template)
    }

    fn render(&self) -> Template {
        let mut template = Template::new(format!("Deployment pipeline {}", self.settings.name));
        add_roles(&mut template);
        template.add_resource(
            ARTIFACTS_BUCKET,
            Resource::new(
                "AWS::S3::Bucket",
                json!({
                    "VersioningConfiguration": { "Status": "Enabled" },
                    "BucketEncryption": {
                        "ServerSideEncryptionConfiguration": [
                            { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" } }
                        ]
                    }
                }),
            ),
        );
        self.add_notifications(&mut template);

        let mut rendered_stages = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut actions = Vec::with_capacity(stage.actions.len());
            for action in &stage.actions {
                let project = match &action.kind {
                    ActionKind::Build(build) | ActionKind::Test(build) => {
                        let id = format!("{}Project", logical_id(&[&stage.name, &action.name]));
                        template.add_resource(id.clone(), build_project(build));
                        Some(id)
                    }
                    _ => None,
                };
                actions.push(action.render(project.as_deref(), DEPLOY_ROLE));
                for hook in &action.hooks {
                    template.add_resource(
                        logical_id(&[&stage.name, &action.name, "StateChange"]),
                        event_rule(stage, action, hook),
                    );
                }
            }
            rendered_stages.push(json!({ "Name": stage.name, "Actions": actions }));
        }

        let mut properties = json!({
            "Name": self.settings.name,
            "RoleArn": get_att(PIPELINE_ROLE, "Arn"),
            "RestartExecutionOnUpdate": true,
            "Stages": rendered_stages,
        });
        let home_store = json!({ "Type": "S3", "Location": ref_(ARTIFACTS_BUCKET) });
        let remote = self.remote_regions();
        if remote.is_empty() {
            properties["ArtifactStore"] = home_store;
        } else {
            // Cross-region actions need one artifact store per region.
            let home_region = match &self.settings.region {
                Some(region) => Value::String(region.clone()),
                None => ref_("AWS::Region"),
            };
            let mut stores = vec![json!({ "Region": home_region, "ArtifactStore": home_store })];
            for region in remote {
                let parameter = region_bucket_parameter(region);
                template.add_parameter(
                    parameter.clone(),
                    format!("Artifact bucket for cross-region actions in {region}"),
                );
                stores.push(json!({
                    "Region": region,
                    "ArtifactStore": { "Type": "S3", "Location": ref_(&parameter) },
                }));
            }
            properties["ArtifactStores"] = Value::Array(stores);
        }

        template.add_resource(
            PIPELINE,
            Resource::new("AWS::CodePipeline::Pipeline", properties).depends_on(PIPELINE_ROLE),
        );
        template
    }

    fn add_notifications(&self, template: &mut Template) {
        template.add_resource(
            NOTIFICATION_TOPIC,
            Resource::new(
                "AWS::SNS::Topic",
                json!({ "TopicName": NOTIFICATION_TOPIC_NAME }),
            ),
        );
        template.add_resource(
            format!("{NOTIFICATION_TOPIC}Policy"),
            Resource::new(
                "AWS::SNS::TopicPolicy",
                json!({
                    "Topics": [ref_(NOTIFICATION_TOPIC)],
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Action": "sns:Publish",
                            "Effect": "Allow",
                            "Principal": { "Service": "events.amazonaws.com" },
                            "Resource": ref_(NOTIFICATION_TOPIC),
                        }]
                    }
                }),
            ),
        );
        if let Some(email) = &self.settings.notification_email {
            template.add_resource(
                format!("{NOTIFICATION_TOPIC}EmailSubscription"),
                Resource::new(
                    "AWS::SNS::Subscription",
                    json!({
                        "Protocol": "email",
                        "Endpoint": email,
                        "TopicArn": ref_(NOTIFICATION_TOPIC),
                    }),
                ),
            );
        }
    }
}

fn required_build(
    slot: &Option<Artifact>,
    source: &Option<Artifact>,
    action: &str,
) -> Result<Artifact> {
    slot.clone().ok_or_else(|| CompositionError::DanglingArtifact {
        action: action.to_string(),
        artifact: source
            .as_ref()
            .map(build_output_name)
            .unwrap_or_else(|| "<build output>".to_string()),
    })
}

fn service_role(service: &str, policy: &str) -> Resource {
    Resource::new(
        "AWS::IAM::Role",
        json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Action": "sts:AssumeRole",
                    "Effect": "Allow",
                    "Principal": { "Service": service }
                }]
            },
            "ManagedPolicyArns": [policy]
        }),
    )
}

fn add_roles(template: &mut Template) {
    template.add_resource(
        PIPELINE_ROLE,
        service_role(
            "codepipeline.amazonaws.com",
            "arn:aws:iam::aws:policy/AWSCodePipeline_FullAccess",
        ),
    );
    template.add_resource(
        BUILD_ROLE,
        service_role(
            "codebuild.amazonaws.com",
            "arn:aws:iam::aws:policy/AWSCodeBuildDeveloperAccess",
        ),
    );
    template.add_resource(
        DEPLOY_ROLE,
        service_role(
            "cloudformation.amazonaws.com",
            "arn:aws:iam::aws:policy/AdministratorAccess",
        ),
    );
}

fn build_project(build: &BuildConfig) -> Resource {
    Resource::new(
        "AWS::CodeBuild::Project",
        json!({
            "Source": { "Type": "CODEPIPELINE", "BuildSpec": build.build_spec },
            "Artifacts": { "Type": "CODEPIPELINE" },
            "Environment": {
                "ComputeType": "BUILD_GENERAL1_SMALL",
                "Image": build.build_image,
                "Type": "LINUX_CONTAINER",
                "PrivilegedMode": false,
            },
            "ServiceRole": get_att(BUILD_ROLE, "Arn"),
        }),
    )
}

fn pipeline_arn() -> Value {
    join(
        "",
        vec![
            json!("arn:"),
            ref_("AWS::Partition"),
            json!(":codepipeline:"),
            ref_("AWS::Region"),
            json!(":"),
            ref_("AWS::AccountId"),
            json!(":"),
            ref_(PIPELINE),
        ],
    )
}

fn event_rule(stage: &Stage, action: &Action, hook: &EventHook) -> Resource {
    let field = &hook.message.field;
    let mut paths = Map::new();
    paths.insert(field.key(), Value::String(field.path().to_string()));
    Resource::new(
        "AWS::Events::Rule",
        json!({
            "Name": hook.rule_name,
            "Description": hook.description,
            "State": "ENABLED",
            "EventPattern": {
                "source": ["aws.codepipeline"],
                "resources": [pipeline_arn()],
                "detail-type": ["CodePipeline Action Execution State Change"],
                "detail": {
                    "stage": [stage.name],
                    "action": [action.name],
                    "state": [hook.state.as_str()],
                }
            },
            "Targets": [{
                "Arn": ref_(&hook.topic),
                "Id": "Target0",
                "InputTransformer": {
                    "InputPathsMap": paths,
                    "InputTemplate": hook.message.input_template(),
                }
            }]
        }),
    )
}
