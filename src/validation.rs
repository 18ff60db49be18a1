use std::collections::HashSet;

use serde::Serialize;

use crate::config::{CONFIG_VERSION, PipelineConfig, ServiceSpec};
use crate::pipeline::{BUILD_STAGE, SELF_UPDATE_STAGE, SOURCE_STAGE};

const MAX_CANARY_NAME_LEN: usize = 21;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != CONFIG_VERSION {
        report
            .errors
            .push(format!("Unsupported config version: {}", config.version));
    }

    if config.pipeline.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }
    if config.pipeline.stack_name.trim().is_empty() {
        report
            .errors
            .push("Pipeline stack name cannot be empty".into());
    }

    report.merge(validate_sources(config));

    let mut labels = HashSet::new();
    for (idx, service) in config.services.iter().enumerate() {
        report.merge(validate_service(idx, service));
        if !service.label.is_empty() && !labels.insert(service.label.as_str()) {
            report
                .errors
                .push(format!("Duplicate service label '{}'", service.label));
        }
    }
    report.merge(validate_targets(config));

    if !config.services.is_empty()
        && !labels.contains(config.pipeline.production_label.as_str())
    {
        report.warnings.push(format!(
            "No service uses the production label '{}'; no deployment guard or canary will be created",
            config.pipeline.production_label
        ));
    }

    report.merge(validate_billing(config));
    report
}

fn validate_sources(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    if config.sources.is_empty() {
        report
            .errors
            .push("At least one source repository is required".into());
        return report;
    }

    let mut artifacts = HashSet::new();
    for (idx, repo) in config.sources.iter().enumerate() {
        if repo.owner.trim().is_empty() {
            report
                .errors
                .push(format!("Source {} has an empty owner", idx + 1));
        }
        if repo.repo.trim().is_empty() {
            report
                .errors
                .push(format!("Source {} has an empty repository name", idx + 1));
        }
        if repo.credential.trim().is_empty() {
            report.errors.push(format!(
                "Source {} ('{}') has an empty credential handle",
                idx + 1,
                repo.repo
            ));
        }
        if repo.branch.trim().is_empty() {
            report
                .errors
                .push(format!("Source {} ('{}') has an empty branch", idx + 1, repo.repo));
        }
        let artifact = repo.artifact_name();
        if !artifacts.insert(artifact.clone()) {
            report.errors.push(format!(
                "Source {} ('{}') produces duplicate artifact '{}'",
                idx + 1,
                repo.repo,
                artifact
            ));
        }
    }
    report
}

fn validate_service(idx: usize, service: &ServiceSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = service.label.as_str();

    if label.trim().is_empty() {
        report
            .errors
            .push(format!("Service {} has an empty label", idx + 1));
        return report;
    }
    if !label.chars().all(|c| c.is_ascii_alphanumeric()) {
        report.errors.push(format!(
            "Service label '{label}' must be alphanumeric; it is embedded in export names"
        ));
    }
    if [SOURCE_STAGE, BUILD_STAGE, SELF_UPDATE_STAGE].contains(&label) {
        report.errors.push(format!(
            "Service label '{label}' collides with a built-in stage name"
        ));
    }
    if let Some(stack) = &service.stack_name
        && stack.trim().is_empty()
    {
        report
            .errors
            .push(format!("Service '{label}' has an empty stack name"));
    }
    if let Some(canary) = &service.canary_name {
        let valid_chars = canary
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if canary.is_empty() || !valid_chars || canary.len() > MAX_CANARY_NAME_LEN {
            report.errors.push(format!(
                "Service '{label}' canary name '{canary}' must be 1-{MAX_CANARY_NAME_LEN} lowercase letters, digits, '-' or '_'"
            ));
        }
    }
    if service.account.is_some() != service.region.is_some() {
        report.warnings.push(format!(
            "Service '{label}' sets only one of account/region; the other falls back to the pipeline's own"
        ));
    }
    report
}

/// Flags services that silently inherit the pipeline's account/region while
/// other services target explicit ones.
fn validate_targets(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let any_explicit = config
        .services
        .iter()
        .any(|s| s.account.is_some() || s.region.is_some());
    if !any_explicit {
        return report;
    }
    for service in &config.services {
        if service.integration_test
            && let Some(region) = &service.region
            && Some(region) != config.pipeline.region.as_ref()
        {
            report.errors.push(format!(
                "Service '{}' deploys to region '{region}'; its integration test cannot import an endpoint exported outside the pipeline's region",
                service.label
            ));
        }
        if service.account.is_none() && service.region.is_none() {
            report.warnings.push(format!(
                "Service '{}' has no account/region and will deploy to the pipeline's own ({}/{})",
                service.label,
                config.pipeline.account.as_deref().unwrap_or("<pipeline account>"),
                config.pipeline.region.as_deref().unwrap_or("<pipeline region>"),
            ));
        }
    }
    report
}

fn validate_billing(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(billing) = &config.billing else {
        return report;
    };

    if billing.budget_amount.is_nan() || billing.budget_amount <= 0.0 {
        report.errors.push(format!(
            "Billing budget must be positive, got {}",
            billing.budget_amount
        ));
    }
    if billing.alert_threshold.is_nan() || billing.alert_threshold <= 0.0 {
        report.errors.push(format!(
            "Billing alert threshold must be positive, got {}",
            billing.alert_threshold
        ));
    } else if billing.alert_threshold >= billing.budget_amount && billing.budget_amount > 0.0 {
        report.warnings.push(format!(
            "Billing alert threshold {} is not below the budget ceiling {}",
            billing.alert_threshold, billing.budget_amount
        ));
    }
    if !is_plausible_email(&billing.email) {
        report
            .errors
            .push(format!("Billing email '{}' is not a valid address", billing.email));
    }
    if let Some(currency) = &billing.currency
        && (currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()))
    {
        report.errors.push(format!(
            "Billing currency '{currency}' must be a three-letter ISO code"
        ));
    }

    if config.services.is_empty() {
        report
            .errors
            .push("Billing stack requires at least one service stage to attach to".into());
    } else if let Some(target) = &billing.attach_to
        && config.service(target).is_none()
    {
        report.errors.push(format!(
            "Billing attach_to refers to unknown service stage '{target}'"
        ));
    }
    report
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_check_accepts_ordinary_addresses() {
        assert!(is_plausible_email("ops@example.com"));
        assert!(!is_plausible_email("ops.example.com"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("ops@localhost"));
    }
}
