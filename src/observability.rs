use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::composition::Composition;
use crate::pipeline::StagePlan;

#[derive(Debug, Default, Serialize, Clone)]
pub struct CompositionSummary {
    pub pipeline: String,
    pub stages: BTreeMap<String, StageSummary>,
    pub stage_count: usize,
    pub action_count: usize,
    pub artifact_count: usize,
    pub exports: Vec<String>,
    pub production_services: usize,
    pub billing: bool,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageSummary {
    pub position: usize,
    pub actions: usize,
    pub waves: usize,
}

impl CompositionSummary {
    pub fn from_composition(composition: &Composition) -> Self {
        let composer = &composition.composer;
        let stages = composer
            .execution_plan()
            .into_iter()
            .enumerate()
            .map(|(position, plan)| {
                let summary = StageSummary {
                    position,
                    actions: plan.waves.iter().map(|w| w.actions.len()).sum(),
                    waves: plan.waves.len(),
                };
                (plan.name, summary)
            })
            .collect();

        Self {
            pipeline: composer.name().to_string(),
            stages,
            stage_count: composer.stages().len(),
            action_count: composer.action_count(),
            artifact_count: composer.artifacts().len(),
            exports: composer
                .published_exports()
                .into_iter()
                .map(str::to_string)
                .collect(),
            production_services: composition
                .services
                .iter()
                .filter(|s| s.environment().is_production())
                .count(),
            billing: composition.billing.is_some(),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP pipeline_composer_stages Number of stages in the pipeline\n");
        output.push_str("# TYPE pipeline_composer_stages gauge\n");
        output.push_str(&format!(
            "pipeline_composer_stages{{pipeline=\"{}\"}} {}\n",
            self.pipeline, self.stage_count
        ));
        output.push_str("# HELP pipeline_composer_actions Number of actions in the pipeline\n");
        output.push_str("# TYPE pipeline_composer_actions gauge\n");
        output.push_str(&format!(
            "pipeline_composer_actions{{pipeline=\"{}\"}} {}\n",
            self.pipeline, self.action_count
        ));
        output.push_str("# HELP pipeline_composer_stage_actions Actions per stage\n");
        output.push_str("# TYPE pipeline_composer_stage_actions gauge\n");
        for (stage, summary) in &self.stages {
            output.push_str(&format!(
                "pipeline_composer_stage_actions{{pipeline=\"{}\",stage=\"{}\"}} {}\n",
                self.pipeline, stage, summary.actions
            ));
        }
        output.push_str("# HELP pipeline_composer_exports Cross-stack exports published\n");
        output.push_str("# TYPE pipeline_composer_exports gauge\n");
        output.push_str(&format!(
            "pipeline_composer_exports{{pipeline=\"{}\"}} {}\n",
            self.pipeline,
            self.exports.len()
        ));
        output
    }
}

pub fn log_summary(summary: &CompositionSummary) {
    info!(
        pipeline = summary.pipeline.as_str(),
        stage_count = summary.stage_count,
        action_count = summary.action_count,
        artifact_count = summary.artifact_count,
        exports = summary.exports.len(),
        production_services = summary.production_services,
        billing = summary.billing,
        "Pipeline composition summary"
    );
    for (stage, metrics) in &summary.stages {
        info!(
            stage = stage.as_str(),
            position = metrics.position,
            actions = metrics.actions,
            waves = metrics.waves,
            "Stage summary"
        );
    }
}

/// Human-readable run-order waves, one line per wave.
pub fn render_plan(plan: &[StagePlan]) -> String {
    let mut output = String::new();
    for (idx, stage) in plan.iter().enumerate() {
        output.push_str(&format!("{}. {}\n", idx + 1, stage.name));
        for wave in &stage.waves {
            output.push_str(&format!(
                "   [{}] {}\n",
                wave.run_order,
                wave.actions.join(", ")
            ));
        }
    }
    output
}
