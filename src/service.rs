use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::artifact::{ArtifactLocation, LocationAttribute};
use crate::canary::{DEFAULT_CANARY_NAME, ServiceHealthCanary};
use crate::exports::{EndpointValue, ExportName};
use crate::template::{Export, Output, Resource, Template, get_att, join, ref_};

pub const PRODUCTION_LABEL: &str = "Prod";
pub const CODE_BUCKET_PARAMETER: &str = "ServiceCodeBucketName";
pub const CODE_KEY_PARAMETER: &str = "ServiceCodeObjectKey";
pub const ENDPOINT_OUTPUT: &str = "ApiEndpointOutput";
pub const ALARM_TOPIC: &str = "ServiceCanaryAlarmTopic";
pub const ALARM_TOPIC_NAME: &str = "ServiceAlarmTopic";
pub const DEPLOYMENT_CONFIG: &str = "CodeDeployDefault.LambdaCanary10Percent5Minutes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Production,
    NonProduction,
}

impl Environment {
    /// Exact, case-sensitive comparison against the production label.
    pub fn from_label(label: &str, production_label: &str) -> Self {
        if label == production_label {
            Environment::Production
        } else {
            Environment::NonProduction
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// One deployable service: a function behind an HTTP API, parameterized by
/// environment label. Production services also get a guarded canary
/// deployment with automatic rollback and a scheduled health check.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    label: String,
    environment: Environment,
    stack_name: String,
    account: Option<String>,
    region: Option<String>,
    canary_name: String,
    generated_at: DateTime<Utc>,
}

impl ServiceDefinition {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_production_label(label, PRODUCTION_LABEL)
    }

    pub fn with_production_label(label: impl Into<String>, production_label: &str) -> Self {
        let label = label.into();
        let environment = Environment::from_label(&label, production_label);
        Self {
            stack_name: format!("ServiceStack{label}"),
            label,
            environment,
            account: None,
            region: None,
            canary_name: DEFAULT_CANARY_NAME.to_string(),
            generated_at: Utc::now(),
        }
    }

    pub fn with_stack_name(mut self, stack_name: impl Into<String>) -> Self {
        self.stack_name = stack_name.into();
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_canary_name(mut self, name: impl Into<String>) -> Self {
        self.canary_name = name.into();
        self
    }

    /// Pins the render timestamp, which otherwise forces a fresh function
    /// version and canary redeploy on every synthesis.
    pub fn with_generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = at;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.stack_name)
    }

    pub fn endpoint_export_name(&self) -> ExportName {
        ExportName::service_endpoint(&self.label)
    }

    /// The endpoint as later stages must consume it.
    pub fn endpoint_export(&self) -> EndpointValue {
        EndpointValue::Import(self.endpoint_export_name())
    }

    /// Direct reference to the endpoint output of this stack.
    pub fn endpoint_output(&self) -> EndpointValue {
        EndpointValue::Output {
            stack: self.stack_name.clone(),
            output: ENDPOINT_OUTPUT.to_string(),
        }
    }

    /// Parameter overrides pointing the function code at a build artifact.
    pub fn resolve(&self, location: &ArtifactLocation) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                CODE_BUCKET_PARAMETER.to_string(),
                location.attribute(LocationAttribute::BucketName),
            ),
            (
                CODE_KEY_PARAMETER.to_string(),
                location.attribute(LocationAttribute::ObjectKey),
            ),
        ])
    }

    pub fn template(&self) -> Template {
        let label = &self.label;
        let mut template = Template::new(format!("Service stack for the {label} environment"));
        template.add_parameter(CODE_BUCKET_PARAMETER, "Bucket holding the service code");
        template.add_parameter(CODE_KEY_PARAMETER, "Object key of the service code");

        template.add_resource(
            "ServiceLambdaServiceRole",
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Action": "sts:AssumeRole",
                            "Effect": "Allow",
                            "Principal": { "Service": "lambda.amazonaws.com" }
                        }]
                    },
                    "ManagedPolicyArns": [
                        "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
                    ]
                }),
            ),
        );
        template.add_resource(
            "ServiceLambda",
            Resource::new(
                "AWS::Lambda::Function",
                json!({
                    "FunctionName": format!("ServiceLambda{label}"),
                    "Runtime": "nodejs16.x",
                    "Handler": "src/lambda.handler",
                    "Code": {
                        "S3Bucket": ref_(CODE_BUCKET_PARAMETER),
                        "S3Key": ref_(CODE_KEY_PARAMETER),
                    },
                    "Role": get_att("ServiceLambdaServiceRole", "Arn"),
                    "Description": format!("Generated on {}", self.generated_at.to_rfc3339()),
                }),
            )
            .depends_on("ServiceLambdaServiceRole"),
        );
        template.add_resource(
            "ServiceLambdaCurrentVersion",
            Resource::new(
                "AWS::Lambda::Version",
                json!({ "FunctionName": ref_("ServiceLambda") }),
            ),
        );

        let mut alias = Resource::new(
            "AWS::Lambda::Alias",
            json!({
                "FunctionName": ref_("ServiceLambda"),
                "FunctionVersion": get_att("ServiceLambdaCurrentVersion", "Version"),
                "Name": format!("ServiceLambdaAlias{label}"),
            }),
        );
        if self.environment.is_production() {
            alias = alias.with_update_policy(json!({
                "CodeDeployLambdaAliasUpdate": {
                    "ApplicationName": ref_("DeploymentGroupApplication"),
                    "DeploymentGroupName": ref_("DeploymentGroup"),
                }
            }));
        }
        template.add_resource("ServiceLambdaAlias", alias);

        template.add_resource(
            "ServiceApi",
            Resource::new(
                "AWS::ApiGatewayV2::Api",
                json!({ "Name": format!("MyService{label}"), "ProtocolType": "HTTP" }),
            ),
        );
        template.add_resource(
            "ServiceIntegration",
            Resource::new(
                "AWS::ApiGatewayV2::Integration",
                json!({
                    "ApiId": ref_("ServiceApi"),
                    "IntegrationType": "AWS_PROXY",
                    "IntegrationUri": ref_("ServiceLambdaAlias"),
                    "PayloadFormatVersion": "2.0",
                }),
            ),
        );
        template.add_resource(
            "ServiceDefaultRoute",
            Resource::new(
                "AWS::ApiGatewayV2::Route",
                json!({
                    "ApiId": ref_("ServiceApi"),
                    "RouteKey": "$default",
                    "Target": join("", vec![json!("integrations/"), ref_("ServiceIntegration")]),
                }),
            ),
        );
        template.add_resource(
            "ServiceDefaultStage",
            Resource::new(
                "AWS::ApiGatewayV2::Stage",
                json!({ "ApiId": ref_("ServiceApi"), "StageName": "$default", "AutoDeploy": true }),
            ),
        );
        template.add_resource(
            "ServiceInvokePermission",
            Resource::new(
                "AWS::Lambda::Permission",
                json!({
                    "Action": "lambda:InvokeFunction",
                    "FunctionName": ref_("ServiceLambdaAlias"),
                    "Principal": "apigateway.amazonaws.com",
                }),
            ),
        );

        if self.environment.is_production() {
            self.add_production_guards(&mut template);
        }

        template.add_output(
            ENDPOINT_OUTPUT,
            Output {
                value: get_att("ServiceApi", "ApiEndpoint"),
                description: Some("Api Endpoint".to_string()),
                export: Some(Export {
                    name: self.endpoint_export_name().to_string(),
                }),
            },
        );

        template
    }

    fn add_production_guards(&self, template: &mut Template) {
        let label = &self.label;
        template.add_resource(
            "ServiceErrorAlarm",
            Resource::new(
                "AWS::CloudWatch::Alarm",
                json!({
                    "AlarmName": format!("ServiceErrorAlarm{label}"),
                    "AlarmDescription": "Service is experiencing errors",
                    "Namespace": "AWS/ApiGateway",
                    "MetricName": "5xx",
                    "Dimensions": [{ "Name": "ApiId", "Value": ref_("ServiceApi") }],
                    "Statistic": "Sum",
                    "Period": 60,
                    "EvaluationPeriods": 1,
                    "Threshold": 1,
                    "ComparisonOperator": "GreaterThanOrEqualToThreshold",
                    "TreatMissingData": "notBreaching",
                }),
            ),
        );
        template.add_resource(
            "DeploymentGroupApplication",
            Resource::new(
                "AWS::CodeDeploy::Application",
                json!({ "ComputePlatform": "Lambda" }),
            ),
        );
        template.add_resource(
            "DeploymentGroupServiceRole",
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Action": "sts:AssumeRole",
                            "Effect": "Allow",
                            "Principal": { "Service": "codedeploy.amazonaws.com" }
                        }]
                    },
                    "ManagedPolicyArns": [
                        "arn:aws:iam::aws:policy/service-role/AWSCodeDeployRoleForLambdaLimited"
                    ]
                }),
            ),
        );
        template.add_resource(
            "DeploymentGroup",
            Resource::new(
                "AWS::CodeDeploy::DeploymentGroup",
                json!({
                    "ApplicationName": ref_("DeploymentGroupApplication"),
                    "ServiceRoleArn": get_att("DeploymentGroupServiceRole", "Arn"),
                    "DeploymentConfigName": DEPLOYMENT_CONFIG,
                    "DeploymentStyle": {
                        "DeploymentType": "BLUE_GREEN",
                        "DeploymentOption": "WITH_TRAFFIC_CONTROL",
                    },
                    "AlarmConfiguration": {
                        "Enabled": true,
                        "Alarms": [{ "Name": ref_("ServiceErrorAlarm") }],
                    },
                    "AutoRollbackConfiguration": {
                        "Enabled": true,
                        "Events": ["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_ALARM"],
                    },
                }),
            ),
        );
        template.add_resource(
            ALARM_TOPIC,
            Resource::new("AWS::SNS::Topic", json!({ "TopicName": ALARM_TOPIC_NAME })),
        );

        ServiceHealthCanary::new(&self.canary_name, get_att("ServiceApi", "ApiEndpoint"))
            .with_alarm_topic(ALARM_TOPIC)
            .with_deployment_trigger(self.generated_at.timestamp_millis().to_string())
            .add_to(template);
    }
}
