use chrono::{TimeZone, Utc};
use pipeline_composer::artifact::Artifact;
use pipeline_composer::canary::CANARY_RUNTIME;
use pipeline_composer::service::{
    CODE_BUCKET_PARAMETER, CODE_KEY_PARAMETER, ENDPOINT_OUTPUT, ServiceDefinition,
};
use serde_json::json;

const GUARD_TYPES: &[&str] = &[
    "AWS::CodeDeploy::DeploymentGroup",
    "AWS::CodeDeploy::Application",
    "AWS::Synthetics::Canary",
];

#[test]
fn production_service_carries_guard_and_canary() {
    let template = ServiceDefinition::new("Prod").template();
    for kind in GUARD_TYPES {
        assert!(template.has_resource_type(kind), "missing {kind}");
    }

    let canary = template.resources_of_type("AWS::Synthetics::Canary").next().unwrap();
    assert_eq!(canary.1.properties["RuntimeVersion"], CANARY_RUNTIME);
    assert_eq!(canary.1.properties["Schedule"]["Expression"], "rate(1 minute)");

    let alias = template.resource("ServiceLambdaAlias").unwrap();
    assert!(alias.update_policy.is_some());
}

#[test]
fn non_production_service_has_neither() {
    for label in ["Test", "prod", "Staging"] {
        let template = ServiceDefinition::new(label).template();
        for kind in GUARD_TYPES {
            assert!(!template.has_resource_type(kind), "{label} has {kind}");
        }
        assert!(!template.has_resource_type("AWS::CloudWatch::Alarm"));
        assert!(template.resource("ServiceLambdaAlias").unwrap().update_policy.is_none());
    }
}

#[test]
fn custom_production_label_is_honored() {
    let live = ServiceDefinition::with_production_label("Live", "Live");
    assert!(live.template().has_resource_type("AWS::Synthetics::Canary"));
    let prod = ServiceDefinition::with_production_label("Prod", "Live");
    assert!(!prod.template().has_resource_type("AWS::Synthetics::Canary"));
}

#[test]
fn endpoint_output_is_exported_by_label() {
    let template = ServiceDefinition::new("Staging").template();
    let output = &template.outputs[ENDPOINT_OUTPUT];
    assert_eq!(output.export.as_ref().unwrap().name, "ServiceEndpointStaging");
    assert_eq!(
        output.value,
        json!({ "Fn::GetAtt": ["ServiceApi", "ApiEndpoint"] })
    );
}

#[test]
fn code_parameters_resolve_against_artifact_location() {
    let service = ServiceDefinition::new("Test");
    let template = service.template();
    assert!(template.parameters.contains_key(CODE_BUCKET_PARAMETER));
    assert!(template.parameters.contains_key(CODE_KEY_PARAMETER));

    let overrides = service.resolve(&Artifact::new("ServiceBuildOutput").location());
    assert_eq!(overrides.len(), 2);
    assert_eq!(
        overrides[CODE_KEY_PARAMETER],
        json!({ "Fn::GetArtifactAtt": ["ServiceBuildOutput", "ObjectKey"] })
    );
}

#[test]
fn pinned_timestamp_renders_deterministically() {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let first = ServiceDefinition::new("Prod").with_generated_at(at).template();
    let second = ServiceDefinition::new("Prod").with_generated_at(at).template();
    assert_eq!(first, second);
}
