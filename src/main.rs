use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use pipeline_composer::composition::{Composition, compose};
use pipeline_composer::config::PipelineConfig;
use pipeline_composer::exports::{DeploymentLedger, ExportName, imported_names};
use pipeline_composer::lockfile::{PipelineLock, generate_lock};
use pipeline_composer::observability::{CompositionSummary, log_summary, render_plan};
use pipeline_composer::presets::generate_preset;
use pipeline_composer::template::Template;
use pipeline_composer::validation::{ValidationReport, validate_config};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let cli = Cli::parse();

    configure_tracing(cli.otlp_endpoint.as_deref())?;

    let result = match cli.command {
        Commands::Synth {
            config,
            output_dir,
            print_summary,
            summary_json,
            summary_prometheus,
        } => synth(
            config,
            output_dir,
            print_summary,
            summary_json,
            summary_prometheus,
        ),
        Commands::Validate { config } => validate_cmd(config),
        Commands::Lint { patterns } => lint_configs(&patterns),
        Commands::Lock { config, output } => lock_config(config, output),
        Commands::Plan { config, json } => plan(config, json),
        Commands::Diff { lhs, rhs } => diff_configs(&lhs, &rhs),
        Commands::Init { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset config generated"
            );
            Ok(())
        }
        Commands::Resolve {
            template,
            exports,
            output,
        } => resolve(template, exports, output),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "pipeline-composer",
                &mut io::stdout(),
            );
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if cli.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "pipeline-composer")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

fn report_issues(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

/// Loads, validates and composes a pipeline config, failing on any
/// validation error.
fn load_and_compose(path: &Path, purpose: &str) -> Result<(PipelineConfig, Composition)> {
    let config = PipelineConfig::load(path)?;
    let report = validate_config(&config);
    report_issues(path, &report);
    if !report.is_ok() {
        bail!(
            "Cannot {purpose} due to {} validation error(s)",
            report.errors.len()
        );
    }
    let composition =
        compose(&config).with_context(|| format!("Failed to compose {}", path.display()))?;
    Ok((config, composition))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn synth(
    config_path: PathBuf,
    output_dir: PathBuf,
    print_summary: bool,
    summary_json: Option<PathBuf>,
    summary_prometheus: Option<PathBuf>,
) -> Result<()> {
    let (_, composition) = load_and_compose(&config_path, "synthesize templates")?;

    let written = composition.write_templates(&output_dir)?;
    for path in &written {
        println!("{}", path.display());
    }
    info!(
        templates = written.len(),
        output = %output_dir.display(),
        "Synthesis completed"
    );

    if print_summary || summary_json.is_some() || summary_prometheus.is_some() {
        let summary = CompositionSummary::from_composition(&composition);
        if print_summary {
            log_summary(&summary);
        }
        if let Some(path) = summary_json {
            ensure_parent(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create summary file: {}", path.display()))?;
            to_writer_pretty(file, &summary)
                .with_context(|| format!("Failed to write summary JSON: {}", path.display()))?;
            info!(summary = %path.display(), "Summary JSON written");
        }
        if let Some(path) = summary_prometheus {
            ensure_parent(&path)?;
            fs::write(&path, summary.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus summary: {}", path.display())
            })?;
            info!(summary = %path.display(), "Prometheus summary written");
        }
    }

    Ok(())
}

fn validate_cmd(config_path: PathBuf) -> Result<()> {
    let config = PipelineConfig::load(&config_path)?;
    let report = validate_config(&config);
    report_issues(&config_path, &report);

    if !report.is_ok() {
        return Err(anyhow!(
            "Config validation failed with {} error(s)",
            report.errors.len()
        ));
    }

    // A config can pass the field checks and still be rejected by the composer.
    compose(&config).with_context(|| format!("Failed to compose {}", config_path.display()))?;
    info!(file = %config_path.display(), "Config validation passed");
    Ok(())
}

fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let entries =
            glob::glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        let before = resolved.len();
        for entry in entries {
            let path = entry.with_context(|| format!("Failed to read match for {pattern}"))?;
            if path.is_file() {
                resolved.push(path);
            }
        }
        if resolved.len() == before {
            warn!(pattern = pattern.as_str(), "Pattern matched no files");
        }
    }
    resolved.sort();
    resolved.dedup();
    Ok(resolved)
}

fn lint_configs(patterns: &[String]) -> Result<()> {
    let configs = expand_patterns(patterns)?;
    if configs.is_empty() {
        bail!("No pipeline config files matched for linting");
    }

    let mut failures = 0usize;
    for config_path in &configs {
        match PipelineConfig::load(config_path) {
            Ok(config) => {
                let report = validate_config(&config);
                report_issues(config_path, &report);
                if !report.is_ok() {
                    failures += 1;
                } else if let Err(err) = compose(&config) {
                    failures += 1;
                    error!(file = %config_path.display(), "Composition failed: {err:#}");
                } else {
                    info!(file = %config_path.display(), "Lint passed");
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %config_path.display(), "Failed to load config: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} config(s)");
    }

    info!(configs = configs.len(), "All config lint checks passed");
    Ok(())
}

fn lock_config(config_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let (config, composition) = load_and_compose(&config_path, "generate lockfile")?;
    ensure_parent(&output_path)?;
    generate_lock(&composition, config.version, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn plan(config_path: PathBuf, json: bool) -> Result<()> {
    let (_, composition) = load_and_compose(&config_path, "plan the pipeline")?;
    let plan = composition.composer.execution_plan();
    if json {
        to_writer_pretty(io::stdout(), &plan).context("Failed to write plan JSON")?;
        println!();
    } else {
        print!("{}", render_plan(&plan));
    }
    Ok(())
}

fn diff_configs(lhs: &Path, rhs: &Path) -> Result<()> {
    let (left_config, left) = load_and_compose(lhs, "diff")?;
    let (right_config, right) = load_and_compose(rhs, "diff")?;
    let left_lock = PipelineLock::from_composition(&left, left_config.version)?;
    let right_lock = PipelineLock::from_composition(&right, right_config.version)?;

    let mut differences = Vec::new();

    if left_lock.pipeline != right_lock.pipeline {
        differences.push(format!(
            "Pipeline name differs: '{}' vs '{}'",
            left_lock.pipeline, right_lock.pipeline
        ));
    }

    let left_names: Vec<_> = left_lock.stages.iter().map(|s| s.name.as_str()).collect();
    let right_names: Vec<_> = right_lock.stages.iter().map(|s| s.name.as_str()).collect();
    if left_names != right_names {
        differences.push(format!(
            "Stage order differs: {left_names:?} vs {right_names:?}"
        ));
    }

    for stage in &left_lock.stages {
        let Some(other) = right_lock.stages.iter().find(|s| s.name == stage.name) else {
            differences.push(format!("Stage '{}' only in left config", stage.name));
            continue;
        };
        for action in &stage.actions {
            match other.actions.iter().find(|a| a.name == action.name) {
                None => differences.push(format!(
                    "Action '{}/{}' only in left config",
                    stage.name, action.name
                )),
                Some(counterpart) if counterpart.run_order != action.run_order => {
                    differences.push(format!(
                        "Action '{}/{}' run order differs: {} vs {}",
                        stage.name, action.name, action.run_order, counterpart.run_order
                    ))
                }
                Some(counterpart) if counterpart.config_hash != action.config_hash => {
                    differences.push(format!(
                        "Action '{}/{}' configuration differs",
                        stage.name, action.name
                    ))
                }
                Some(_) => {}
            }
        }
        for action in &other.actions {
            if !stage.actions.iter().any(|a| a.name == action.name) {
                differences.push(format!(
                    "Action '{}/{}' only in right config",
                    stage.name, action.name
                ));
            }
        }
    }
    for stage in &right_lock.stages {
        if !left_lock.stages.iter().any(|s| s.name == stage.name) {
            differences.push(format!("Stage '{}' only in right config", stage.name));
        }
    }

    let left_stacks: Vec<_> = left.templates().into_iter().map(|(name, _)| name).collect();
    let right_stacks: Vec<_> = right.templates().into_iter().map(|(name, _)| name).collect();
    if left_stacks != right_stacks {
        differences.push(format!(
            "Deployed stacks differ: {left_stacks:?} vs {right_stacks:?}"
        ));
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Pipelines are equivalent"
        );
        println!("Pipelines match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Pipeline differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Pipelines differ ({} difference(s) found)", differences.len());
    }
}

/// Deploy-time step: substitutes imports in a synthesized template with the
/// values exported by stacks that are already deployed.
fn resolve(template_path: PathBuf, exports_path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let content = fs::read_to_string(&template_path)
        .with_context(|| format!("Failed to read template: {}", template_path.display()))?;
    let template: Template = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse template JSON: {}", template_path.display()))?;

    let exports_content = fs::read_to_string(&exports_path)
        .with_context(|| format!("Failed to read exports: {}", exports_path.display()))?;
    let deployed: BTreeMap<String, BTreeMap<String, String>> =
        serde_yaml::from_str(&exports_content)
            .with_context(|| format!("Failed to parse exports YAML: {}", exports_path.display()))?;

    let mut ledger = DeploymentLedger::new();
    for (stack, values) in deployed {
        for (name, value) in values {
            ledger.publish(&stack, ExportName::new(name), value)?;
        }
    }

    let rendered = template
        .to_value()
        .context("Failed to serialize template")?;
    let imports = imported_names(&rendered);
    let resolved = ledger.resolve(&rendered).with_context(|| {
        format!(
            "Failed to resolve imports of {} against {}",
            template_path.display(),
            exports_path.display()
        )
    })?;
    info!(
        template = %template_path.display(),
        imports = imports.len(),
        exports = ledger.len(),
        "Imports resolved"
    );

    let serialized = serde_json::to_string_pretty(&resolved)?;
    match output {
        Some(path) => {
            ensure_parent(&path)?;
            fs::write(&path, serialized)
                .with_context(|| format!("Failed to write template: {}", path.display()))?;
            info!(output = %path.display(), "Resolved template written");
        }
        None => println!("{serialized}"),
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "pipeline-composer",
    version,
    about = "Compose self-updating deployment pipelines into provisioning templates"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose a pipeline config and write one template per stack.
    Synth {
        #[arg(value_hint = ValueHint::FilePath)]
        config: PathBuf,
        #[arg(long = "output-dir", default_value = "templates")]
        output_dir: PathBuf,
        #[arg(long)]
        print_summary: bool,
        #[arg(long = "summary-json")]
        summary_json: Option<PathBuf>,
        #[arg(long = "summary-prometheus")]
        summary_prometheus: Option<PathBuf>,
    },
    Validate {
        config: PathBuf,
    },
    /// Validate every config matching the given glob patterns.
    Lint {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    Lock {
        config: PathBuf,
        output: PathBuf,
    },
    /// Print the run-order waves of every stage.
    Plan {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
    /// Write a starter config from a preset.
    Init {
        #[arg(long, help = "Preset name: single, staged or cross-region")]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Substitute cross-stack imports with deployed export values.
    Resolve {
        template: PathBuf,
        #[arg(long)]
        exports: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
