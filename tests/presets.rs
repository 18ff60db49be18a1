use pipeline_composer::composition::compose;
use pipeline_composer::config::PipelineConfig;
use pipeline_composer::exports::imported_names;
use pipeline_composer::presets::{PRESETS, generate_preset, preset_config};
use pipeline_composer::validation::validate_config;
use std::fs;
use tempfile::tempdir;

#[test]
fn generate_staged_preset_writes_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("nested").join("staged.yaml");
    let generated = generate_preset("staged", &path).expect("preset generation");
    assert!(generated.exists());
    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("label: Prod"));
    assert!(contents.contains("integration_test: true"));

    let config = PipelineConfig::load(&generated).expect("preset loads back");
    assert_eq!(config.services.len(), 2);
}

#[test]
fn every_preset_validates_and_composes() {
    for name in PRESETS {
        let config = preset_config(name).unwrap();
        let report = validate_config(&config);
        assert!(report.is_ok(), "{name}: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "{name}: {:?}", report.warnings);
        let composition = compose(&config).unwrap();
        assert!(composition.billing.is_some());
    }
}

#[test]
fn cross_region_preset_deploys_backup_remotely() {
    let composition = compose(&preset_config("cross-region").unwrap()).unwrap();
    let stage = composition.composer.stage_by_name("ProdBackup").unwrap();
    let target = &composition.composer.stage(stage).unwrap().actions[0]
        .deploy_config()
        .unwrap()
        .target;
    assert!(target.cross_region);
    assert!(!target.cross_account);
    assert_eq!(target.region.as_deref(), Some("us-west-2"));

    let pipeline = &composition
        .pipeline_template
        .resource("Pipeline")
        .unwrap()
        .properties;
    assert!(pipeline.get("ArtifactStore").is_none());
    let regions: Vec<_> = pipeline["ArtifactStores"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["Region"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(regions, vec!["us-east-1", "us-west-2"]);

    // The backup endpoint lives in another region, so nothing imports it.
    let rendered = composition.pipeline_template.to_value().unwrap();
    assert!(
        !imported_names(&rendered).contains(&"ServiceEndpointProdBackup".to_string())
    );
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("mystery", &temp.path().join("x.yaml")).unwrap_err();
    assert!(err.to_string().contains("Unknown preset 'mystery'"));
}
