//! Entry composition script: turns a [`PipelineConfig`] into a finalized
//! pipeline plus the templates of every stack it deploys.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument};

use crate::billing::BillingDefinition;
use crate::config::PipelineConfig;
use crate::pipeline::{PipelineComposer, StageHandle};
use crate::service::ServiceDefinition;
use crate::template::Template;

#[derive(Debug, Clone)]
pub struct Composition {
    pub composer: PipelineComposer,
    pub pipeline_template: Template,
    pub services: Vec<ServiceDefinition>,
    pub billing: Option<BillingDefinition>,
}

#[instrument(skip(config), fields(pipeline = %config.pipeline.name))]
pub fn compose(config: &PipelineConfig) -> Result<Composition> {
    config.ensure_version()?;
    let settings = config.pipeline.clone();
    let production_label = settings.production_label.clone();
    let mut composer = PipelineComposer::new(settings);

    let sources = composer
        .add_source_stage(&config.sources)
        .context("Failed to add source stage")?;
    composer
        .add_build_stage(&sources)
        .context("Failed to add build stage")?;
    if config.self_update {
        composer
            .add_self_update_stage()
            .context("Failed to add self-update stage")?;
    }

    let mut services = Vec::with_capacity(config.services.len());
    let mut service_stages: Vec<(String, StageHandle)> = Vec::new();
    for spec in &config.services {
        let service = spec.definition(&production_label);
        let stage = composer
            .add_service_stage(&service, &spec.label)
            .with_context(|| format!("Failed to add service stage '{}'", spec.label))?;
        if spec.integration_test {
            composer
                .add_service_integration_test_to_stage(stage, service.endpoint_export())
                .with_context(|| {
                    format!("Failed to add integration test to stage '{}'", spec.label)
                })?;
        }
        service_stages.push((spec.label.clone(), stage));
        services.push(service);
    }

    let billing = match &config.billing {
        Some(spec) => {
            let billing = spec.definition();
            let target = match &spec.attach_to {
                Some(label) => service_stages
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, handle)| *handle)
                    .ok_or_else(|| anyhow!("Billing attach_to refers to unknown stage '{label}'"))?,
                None => service_stages
                    .iter()
                    .find(|(l, _)| *l == production_label)
                    .or_else(|| service_stages.last())
                    .map(|(_, handle)| *handle)
                    .ok_or_else(|| anyhow!("Billing stack requires at least one service stage"))?,
            };
            composer
                .add_billing_stack_to_stage(&billing, target)
                .context("Failed to attach billing stack")?;
            Some(billing)
        }
        None => None,
    };

    let pipeline_template = composer.finalize().context("Failed to finalize pipeline")?;
    info!(
        stages = composer.stages().len(),
        services = services.len(),
        billing = billing.is_some(),
        "Composition complete"
    );

    Ok(Composition {
        composer,
        pipeline_template,
        services,
        billing,
    })
}

impl Composition {
    /// `(stack name, template)` for every stack, pipeline first.
    pub fn templates(&self) -> Vec<(String, Template)> {
        let mut templates = vec![(
            self.composer.settings().stack_name.clone(),
            self.pipeline_template.clone(),
        )];
        for service in &self.services {
            templates.push((service.stack_name().to_string(), service.template()));
        }
        if let Some(billing) = &self.billing {
            templates.push((billing.stack_name().to_string(), billing.template()));
        }
        templates
    }

    /// Writes `<stack>.template.json` for every stack into `directory`.
    pub fn write_templates(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(directory).with_context(|| {
            format!("Failed to create output directory: {}", directory.display())
        })?;

        let mut written = Vec::new();
        for (stack, template) in self.templates() {
            let path = directory.join(format!("{stack}.template.json"));
            if written.contains(&path) {
                bail!("Two stacks render to the same file: {}", path.display());
            }
            let content = template
                .to_json_pretty()
                .with_context(|| format!("Failed to render template for {stack}"))?;
            fs::write(&path, content)
                .with_context(|| format!("Failed to write template: {}", path.display()))?;
            info!(stack = stack.as_str(), path = %path.display(), "Template written");
            written.push(path);
        }
        Ok(written)
    }
}
