use std::fs;

use pipeline_composer::action::RepositoryRef;
use pipeline_composer::composition::compose;
use pipeline_composer::config::{BillingSpec, CONFIG_VERSION, PipelineConfig, ServiceSpec};
use pipeline_composer::lockfile::{PipelineLock, generate_lock};
use pipeline_composer::pipeline::PipelineSettings;
use pipeline_composer::validation::validate_config;
use tempfile::tempdir;

fn base_config() -> PipelineConfig {
    PipelineConfig {
        version: CONFIG_VERSION,
        pipeline: PipelineSettings::new("Pipeline"),
        sources: vec![
            RepositoryRef::new("example-org", "pipeline", "github-token"),
            RepositoryRef::new("example-org", "service", "github-token"),
        ],
        self_update: true,
        services: vec![ServiceSpec::new("Test"), ServiceSpec::new("Prod")],
        billing: None,
    }
}

fn billing(budget: f64, threshold: f64) -> BillingSpec {
    BillingSpec {
        stack_name: None,
        budget_amount: budget,
        email: "ops@example.com".into(),
        alert_threshold: threshold,
        currency: None,
        attach_to: None,
    }
}

fn has_error(config: &PipelineConfig, needle: &str) -> bool {
    validate_config(config)
        .errors
        .iter()
        .any(|e| e.contains(needle))
}

#[test]
fn base_config_passes_without_warnings() {
    let report = validate_config(&base_config());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn validation_catches_duplicates() {
    let mut config = base_config();
    config.services.push(ServiceSpec::new("Test"));
    assert!(has_error(&config, "Duplicate service label 'Test'"));

    let mut config = base_config();
    config
        .sources
        .push(RepositoryRef::new("other-org", "service", "github-token"));
    assert!(has_error(&config, "duplicate artifact 'ServiceSourceOutput'"));
}

#[test]
fn validation_rejects_bad_fields() {
    let mut config = base_config();
    config.version = 2;
    config.sources[0].credential = " ".into();
    config.services.push(ServiceSpec::new("Build"));
    config.services.push(ServiceSpec::new("Pre-Prod"));
    config.services[0].canary_name = Some("Way_Too_Long_Canary_Name_For_Synthetics".into());

    let report = validate_config(&config);
    assert!(!report.is_ok());
    assert!(report.errors.iter().any(|e| e.contains("Unsupported config version: 2")));
    assert!(report.errors.iter().any(|e| e.contains("empty credential handle")));
    assert!(report.errors.iter().any(|e| e.contains("collides with a built-in stage")));
    assert!(report.errors.iter().any(|e| e.contains("must be alphanumeric")));
    assert!(report.errors.iter().any(|e| e.contains("canary name")));
}

#[test]
fn empty_sources_are_an_error() {
    let mut config = base_config();
    config.sources.clear();
    assert!(has_error(&config, "At least one source repository is required"));
}

#[test]
fn billing_checks_budget_and_target() {
    let mut config = base_config();
    config.billing = Some(billing(0.0, 5.0));
    assert!(has_error(&config, "budget must be positive"));

    let mut config = base_config();
    let mut spec = billing(20.0, 5.0);
    spec.email = "not-an-address".into();
    spec.attach_to = Some("Staging".into());
    config.billing = Some(spec);
    let report = validate_config(&config);
    assert!(report.errors.iter().any(|e| e.contains("not a valid address")));
    assert!(report.errors.iter().any(|e| e.contains("unknown service stage 'Staging'")));

    let mut config = base_config();
    config.services.clear();
    config.billing = Some(billing(20.0, 5.0));
    assert!(has_error(&config, "requires at least one service stage"));
}

#[test]
fn threshold_at_or_above_budget_warns() {
    let mut config = base_config();
    config.billing = Some(billing(5.0, 5.0));
    let report = validate_config(&config);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("not below the budget ceiling"))
    );
}

#[test]
fn mixed_account_targets_warn_about_fallback() {
    let mut config = base_config();
    config.services[1].account = Some("222222222222".into());
    let report = validate_config(&config);
    assert!(report.is_ok());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("Service 'Test' has no account/region"))
    );
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("Service 'Prod' sets only one of account/region"))
    );
}

#[test]
fn integration_test_in_another_region_is_an_error() {
    let mut config = base_config();
    config.pipeline.region = Some("us-east-1".into());
    config.services[1].account = Some("111111111111".into());
    config.services[1].region = Some("us-west-2".into());
    config.services[1].integration_test = true;
    assert!(has_error(
        &config,
        "Service 'Prod' deploys to region 'us-west-2'"
    ));

    config.services[1].region = Some("us-east-1".into());
    assert!(validate_config(&config).is_ok());
}

#[test]
fn unsupported_version_is_rejected_on_load_and_compose() {
    let mut config = base_config();
    config.version = 2;
    let err = compose(&config).err().unwrap();
    assert!(err.to_string().contains("Unsupported config version: 2"));

    let yaml = config.to_yaml().unwrap();
    let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
    assert!(format!("{err:#}").contains("Unsupported config version: 2"));

    config.version = CONFIG_VERSION;
    let yaml = config.to_yaml().unwrap();
    assert_eq!(PipelineConfig::from_yaml(&yaml).unwrap().version, 1);
}

#[test]
fn missing_production_stage_warns() {
    let mut config = base_config();
    config.services = vec![ServiceSpec::new("Test")];
    let report = validate_config(&config);
    assert!(report.warnings.iter().any(|w| w.contains("production label 'Prod'")));
}

#[test]
fn lockfile_hashes_every_action() {
    let temp = tempdir().unwrap();
    let mut config = base_config();
    config.services[0].integration_test = true;
    config.billing = Some(billing(20.0, 5.0));
    let composition = compose(&config).unwrap();

    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&composition, config.version, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("config_version: 1"));
    assert!(content.contains("config_hash"));

    let lock: PipelineLock = serde_yaml::from_str(&content).unwrap();
    let names: Vec<_> = lock.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Source", "Build", "Pipeline_Update", "Test", "Prod"]);

    let test_stage = &lock.stages[3];
    assert_eq!(test_stage.actions.len(), 2);
    assert_eq!(test_stage.actions[1].name, "Integration_Test");
    assert_eq!(test_stage.actions[1].category, "Test");
    assert_eq!(test_stage.actions[1].run_order, 2);

    let prod_stage = &lock.stages[4];
    assert_eq!(prod_stage.actions[1].name, "Billing_Update");
    assert!(
        lock.stages
            .iter()
            .flat_map(|s| &s.actions)
            .all(|a| a.config_hash.len() == 64)
    );
}

#[test]
fn lock_hashes_are_stable_across_compositions() {
    let config = base_config();
    let first = PipelineLock::from_composition(&compose(&config).unwrap(), 1).unwrap();
    let second = PipelineLock::from_composition(&compose(&config).unwrap(), 1).unwrap();
    let hashes = |lock: &PipelineLock| {
        lock.stages
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| a.config_hash.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(hashes(&first), hashes(&second));
}
