use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::composition::Composition;

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub config_version: u32,
    pub generated_at: DateTime<Utc>,
    pub pipeline: String,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub actions: Vec<ActionLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionLock {
    pub name: String,
    pub category: String,
    pub run_order: u32,
    pub config_hash: String,
}

impl PipelineLock {
    pub fn from_composition(composition: &Composition, config_version: u32) -> Result<Self> {
        let pipeline = composition
            .pipeline_template
            .resource("Pipeline")
            .ok_or_else(|| anyhow!("Rendered template has no Pipeline resource"))?;
        let rendered = pipeline
            .properties
            .get("Stages")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("Pipeline resource has no rendered stages"))?;

        let mut stages = Vec::with_capacity(composition.composer.stages().len());
        for (stage, rendered_stage) in composition.composer.stages().iter().zip(rendered) {
            let rendered_actions = rendered_stage
                .get("Actions")
                .and_then(Value::as_array)
                .with_context(|| format!("Stage '{}' has no rendered actions", stage.name))?;
            let actions = stage
                .actions
                .iter()
                .zip(rendered_actions)
                .map(|(action, rendered)| ActionLock {
                    name: action.name.clone(),
                    category: action.kind.category().to_string(),
                    run_order: action.run_order,
                    config_hash: hash_action(&stage.name, rendered),
                })
                .collect();
            stages.push(StageLock {
                name: stage.name.clone(),
                actions,
            });
        }

        Ok(Self {
            config_version,
            generated_at: Utc::now(),
            pipeline: composition.composer.name().to_string(),
            stages,
        })
    }
}

pub fn generate_lock(composition: &Composition, config_version: u32, path: &Path) -> Result<()> {
    let lock = PipelineLock::from_composition(composition, config_version)?;

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn hash_action(stage: &str, rendered: &Value) -> String {
    let mut hasher = Sha256::new();
    let serialized = serde_json::to_vec(rendered).unwrap_or_default();
    hasher.update(stage.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
