use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::action::RepositoryRef;
use crate::config::{BillingSpec, CONFIG_VERSION, PipelineConfig, ServiceSpec};
use crate::pipeline::PipelineSettings;

pub const PRESETS: &[&str] = &["single", "staged", "cross-region"];

const OWNER: &str = "my-org";
const CREDENTIAL: &str = "github-token";
const ALERT_EMAIL: &str = "alerts@example.com";

pub fn preset_config(name: &str) -> Result<PipelineConfig> {
    let config = match name {
        "single" => single_preset(),
        "staged" => staged_preset(),
        "cross-region" => cross_region_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}' (available: {})",
            PRESETS.join(", ")
        ),
    };
    Ok(config)
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = preset_config(name)?;

    let rendered = preset.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset config: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn base(name: &str) -> PipelineConfig {
    PipelineConfig {
        version: CONFIG_VERSION,
        pipeline: PipelineSettings {
            notification_email: Some(ALERT_EMAIL.into()),
            ..PipelineSettings::new(name)
        },
        sources: vec![
            RepositoryRef::new(OWNER, "pipeline", CREDENTIAL),
            RepositoryRef::new(OWNER, "service", CREDENTIAL),
        ],
        self_update: true,
        services: Vec::new(),
        billing: None,
    }
}

fn billing(budget: f64) -> BillingSpec {
    BillingSpec {
        stack_name: None,
        budget_amount: budget,
        email: ALERT_EMAIL.into(),
        alert_threshold: 5.0,
        currency: None,
        attach_to: None,
    }
}

fn tested(label: &str) -> ServiceSpec {
    ServiceSpec {
        integration_test: true,
        ..ServiceSpec::new(label)
    }
}

fn single_preset() -> PipelineConfig {
    PipelineConfig {
        services: vec![ServiceSpec::new("Prod")],
        billing: Some(billing(15.0)),
        ..base("SinglePipeline")
    }
}

fn staged_preset() -> PipelineConfig {
    PipelineConfig {
        services: vec![tested("Test"), tested("Prod")],
        billing: Some(billing(15.0)),
        ..base("StagedPipeline")
    }
}

fn cross_region_preset() -> PipelineConfig {
    let mut config = PipelineConfig {
        services: vec![
            tested("Test"),
            tested("Prod"),
            ServiceSpec {
                region: Some("us-west-2".into()),
                account: Some("111111111111".into()),
                ..ServiceSpec::new("ProdBackup")
            },
        ],
        billing: Some(billing(50.0)),
        ..base("CrossRegionPipeline")
    };
    config.pipeline.account = Some("111111111111".into());
    config.pipeline.region = Some("us-east-1".into());
    for service in config.services.iter_mut().take(2) {
        service.account = config.pipeline.account.clone();
        service.region = config.pipeline.region.clone();
    }
    config
}
