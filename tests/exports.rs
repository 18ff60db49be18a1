use std::collections::BTreeMap;

use pipeline_composer::exports::{DeploymentLedger, ExportError, ExportName, imported_names};
use pipeline_composer::pipeline::PipelineComposer;
use pipeline_composer::service::{ENDPOINT_OUTPUT, ServiceDefinition};
use pipeline_composer::action::RepositoryRef;
use serde_json::json;

#[test]
fn ledger_records_exported_outputs() {
    let service = ServiceDefinition::new("Test");
    let template = service.template();
    let outputs = BTreeMap::from([(
        ENDPOINT_OUTPUT.to_string(),
        "https://abc.execute-api.us-east-1.amazonaws.com".to_string(),
    )]);

    let mut ledger = DeploymentLedger::new();
    let recorded = ledger
        .record(service.stack_name(), &template, &outputs)
        .unwrap();
    assert_eq!(recorded, 1);
    assert_eq!(
        ledger.lookup(&ExportName::service_endpoint("Test")),
        Some("https://abc.execute-api.us-east-1.amazonaws.com")
    );
    assert_eq!(ledger.lookup(&ExportName::service_endpoint("test")), None);
}

#[test]
fn same_export_from_two_stacks_is_rejected() {
    let mut ledger = DeploymentLedger::new();
    ledger
        .publish("ServiceStackTest", ExportName::new("ServiceEndpointTest"), "a")
        .unwrap();
    // Redeploying the owning stack updates the value.
    ledger
        .publish("ServiceStackTest", ExportName::new("ServiceEndpointTest"), "b")
        .unwrap();
    let err = ledger
        .publish("OtherStack", ExportName::new("ServiceEndpointTest"), "c")
        .unwrap_err();
    assert_eq!(
        err,
        ExportError::DuplicateExport {
            name: "ServiceEndpointTest".into(),
            owner: "ServiceStackTest".into(),
            stack: "OtherStack".into(),
        }
    );
    assert_eq!(ledger.lookup(&ExportName::new("ServiceEndpointTest")), Some("b"));
}

#[test]
fn rendered_pipeline_imports_resolve_after_deploy() {
    let mut composer = PipelineComposer::initialize("Pipeline");
    let sources = composer
        .add_source_stage(&[RepositoryRef::new("example-org", "pipeline", "token")])
        .unwrap();
    composer.add_build_stage(&sources).unwrap();
    let test = ServiceDefinition::new("Test");
    let stage = composer.add_service_stage(&test, "Test").unwrap();
    composer
        .add_service_integration_test_to_stage(stage, test.endpoint_export())
        .unwrap();
    let rendered = composer.finalize().unwrap().to_value().unwrap();

    assert_eq!(imported_names(&rendered), vec!["ServiceEndpointTest"]);

    let empty = DeploymentLedger::new();
    assert_eq!(
        empty.resolve(&rendered),
        Err(ExportError::UnresolvedImport("ServiceEndpointTest".into()))
    );

    let ledger = DeploymentLedger::from_values(
        test.stack_name(),
        BTreeMap::from([("ServiceEndpointTest".to_string(), "https://svc.test".to_string())]),
    )
    .unwrap();
    let resolved = ledger.resolve(&rendered).unwrap();
    assert!(imported_names(&resolved).is_empty());

    let env = &resolved["Resources"]["Pipeline"]["Properties"]["Stages"][2]["Actions"][1]
        ["Configuration"]["EnvironmentVariables"]["Fn::Join"][1];
    let joined: String = env
        .as_array()
        .unwrap()
        .iter()
        .map(|part| part.as_str().unwrap())
        .collect();
    let variables: serde_json::Value = serde_json::from_str(&joined).unwrap();
    assert_eq!(
        variables,
        json!([{ "name": "SERVICE_ENDPOINT", "type": "PLAINTEXT", "value": "https://svc.test" }])
    );
}
