use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::action::RepositoryRef;
use crate::billing::{BillingDefinition, DEFAULT_ALERT_THRESHOLD};
use crate::pipeline::PipelineSettings;
use crate::service::ServiceDefinition;

pub const CONFIG_VERSION: u32 = 1;

/// YAML description of a whole pipeline: where code comes from, which
/// services get a stage, and the optional billing stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    pub sources: Vec<RepositoryRef>,
    #[serde(default = "default_true")]
    pub self_update: bool,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingSpec>,
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline config YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Invalid pipeline config")?;
        config.ensure_version()?;
        Ok(config)
    }

    pub fn ensure_version(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            bail!(
                "Unsupported config version: {} (expected {CONFIG_VERSION})",
                self.version
            );
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize pipeline config")
    }

    pub fn service(&self, label: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.label == label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub integration_test: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_name: Option<String>,
}

impl ServiceSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stack_name: None,
            account: None,
            region: None,
            integration_test: false,
            canary_name: None,
        }
    }

    pub fn definition(&self, production_label: &str) -> ServiceDefinition {
        let mut service = ServiceDefinition::with_production_label(&self.label, production_label);
        if let Some(stack_name) = &self.stack_name {
            service = service.with_stack_name(stack_name);
        }
        if let Some(account) = &self.account {
            service = service.with_account(account);
        }
        if let Some(region) = &self.region {
            service = service.with_region(region);
        }
        if let Some(canary) = &self.canary_name {
            service = service.with_canary_name(canary);
        }
        service
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    pub budget_amount: f64,
    pub email: String,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Label of the service stage that also deploys the billing stack.
    /// Defaults to the production stage, else the last service stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_to: Option<String>,
}

fn default_alert_threshold() -> f64 {
    DEFAULT_ALERT_THRESHOLD
}

impl BillingSpec {
    pub fn definition(&self) -> BillingDefinition {
        let mut billing = BillingDefinition::new(self.budget_amount, &self.email)
            .with_alert_threshold(self.alert_threshold);
        if let Some(stack_name) = &self.stack_name {
            billing = billing.with_stack_name(stack_name);
        }
        if let Some(currency) = &self.currency {
            billing = billing.with_currency(currency);
        }
        billing
    }
}
