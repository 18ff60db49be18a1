use serde_json::{Value, json};

use crate::template::{Resource, Template, get_att, join, logical_id, ref_};

pub const DEFAULT_CANARY_NAME: &str = "service-canary";
pub const CANARY_RUNTIME: &str = "syn-nodejs-puppeteer-3.1";
pub const CANARY_SCHEDULE: &str = "rate(1 minute)";
pub const CANARY_TIME_TO_LIVE_SECS: u64 = 5 * 60;
pub const CANARY_FAILED_ALARM: &str = "CanaryFailedAlarm";
/// Success percentage under which the canary alarm fires.
pub const CANARY_SUCCESS_THRESHOLD: f64 = 99.0;

const CANARY_SCRIPT: &str = include_str!("../assets/canary.js");

/// Scheduled external health check against a service endpoint, with an
/// alarm publishing to a topic when checks start failing.
#[derive(Debug, Clone)]
pub struct ServiceHealthCanary {
    pub name: String,
    pub api_endpoint: Value,
    pub alarm_topic: Option<String>,
    pub deployment_trigger: String,
    pub time_to_live_secs: u64,
}

impl ServiceHealthCanary {
    pub fn new(name: impl Into<String>, api_endpoint: Value) -> Self {
        Self {
            name: name.into(),
            api_endpoint,
            alarm_topic: None,
            deployment_trigger: String::new(),
            time_to_live_secs: CANARY_TIME_TO_LIVE_SECS,
        }
    }

    /// Logical id of the topic the failure alarm publishes to.
    pub fn with_alarm_topic(mut self, topic: impl Into<String>) -> Self {
        self.alarm_topic = Some(topic.into());
        self
    }

    /// Changing this value forces the canary to be redeployed.
    pub fn with_deployment_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.deployment_trigger = trigger.into();
        self
    }

    pub fn logical_id(&self) -> String {
        logical_id(&[&self.name])
    }

    pub fn alarm_logical_id(&self) -> String {
        format!("{}FailedAlarm", self.logical_id())
    }

    pub fn add_to(&self, template: &mut Template) {
        let id = self.logical_id();
        let bucket = format!("{id}ArtifactsBucket");
        let role = format!("{id}ServiceRole");

        template.add_resource(
            bucket.clone(),
            Resource::new(
                "AWS::S3::Bucket",
                json!({ "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [
                        { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" } }
                    ]
                }}),
            ),
        );
        template.add_resource(
            role.clone(),
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
                        "arn:aws:iam::aws:policy/CloudWatchSyntheticsFullAccess"
                    ]
                }),
            ),
        );
        template.add_resource(
            id.clone(),
            Resource::new(
                "AWS::Synthetics::Canary",
                json!({
                    "Name": self.name,
                    "RuntimeVersion": CANARY_RUNTIME,
                    "ExecutionRoleArn": get_att(&role, "Arn"),
                    "ArtifactS3Location": join("", vec![json!("s3://"), ref_(&bucket)]),
                    "Schedule": {
                        "Expression": CANARY_SCHEDULE,
                        "DurationInSeconds": self.time_to_live_secs.to_string(),
                    },
                    "RunConfig": {
                        "EnvironmentVariables": {
                            "API_ENDPOINT": self.api_endpoint,
                            "DEPLOYMENT_TRIGGER": self.deployment_trigger,
                        }
                    },
                    "Code": {
                        "Handler": "index.handler",
                        "Script": CANARY_SCRIPT,
                    },
                    "StartCanaryAfterCreation": true,
                }),
            ),
        );

        let mut alarm = json!({
            "AlarmName": CANARY_FAILED_ALARM,
            "AlarmDescription": "Service health check is failing",
            "Namespace": "CloudWatchSynthetics",
            "MetricName": "SuccessPercent",
            "Dimensions": [{ "Name": "CanaryName", "Value": ref_(&id) }],
            "Statistic": "Average",
            "Period": 60,
            "EvaluationPeriods": 1,
            "Threshold": CANARY_SUCCESS_THRESHOLD,
            "ComparisonOperator": "LessThanThreshold",
            "TreatMissingData": "notBreaching",
        });
        if let Some(topic) = &self.alarm_topic {
            alarm["AlarmActions"] = json!([ref_(topic)]);
        }
        template.add_resource(
            self.alarm_logical_id(),
            Resource::new("AWS::CloudWatch::Alarm", alarm),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_passes_endpoint_through_environment() {
        let mut template = Template::new("test");
        ServiceHealthCanary::new("test-canary", json!("api.example.com"))
            .with_alarm_topic("AlarmTopic")
            .add_to(&mut template);

        let canary = template.resource("TestCanary").unwrap();
        assert_eq!(canary.kind, "AWS::Synthetics::Canary");
        assert_eq!(
            canary.properties["RunConfig"]["EnvironmentVariables"]["API_ENDPOINT"],
            "api.example.com"
        );
        assert_eq!(canary.properties["Schedule"]["Expression"], CANARY_SCHEDULE);
        assert_eq!(canary.properties["Schedule"]["DurationInSeconds"], "300");

        let alarm = template.resource("TestCanaryFailedAlarm").unwrap();
        assert_eq!(alarm.properties["AlarmActions"][0], ref_("AlarmTopic"));
    }
}
