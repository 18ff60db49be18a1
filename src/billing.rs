use serde_json::json;

use crate::template::{Resource, Template};

pub const DEFAULT_STACK_NAME: &str = "BillingStack";
pub const DEFAULT_CURRENCY: &str = "USD";
/// Absolute spend that triggers the alert, independent of the budget ceiling.
pub const DEFAULT_ALERT_THRESHOLD: f64 = 5.0;

/// Monthly cost budget with a single email alert.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingDefinition {
    stack_name: String,
    budget_amount: f64,
    email: String,
    alert_threshold: f64,
    currency: String,
}

impl BillingDefinition {
    pub fn new(budget_amount: f64, email: impl Into<String>) -> Self {
        Self {
            stack_name: DEFAULT_STACK_NAME.to_string(),
            budget_amount,
            email: email.into(),
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_stack_name(mut self, stack_name: impl Into<String>) -> Self {
        self.stack_name = stack_name.into();
        self
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn budget_amount(&self) -> f64 {
        self.budget_amount
    }

    pub fn alert_threshold(&self) -> f64 {
        self.alert_threshold
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.stack_name)
    }

    pub fn template(&self) -> Template {
        let mut template = Template::new("Monthly billing budget and spend alert");
        template.add_resource(
            "Budget",
            Resource::new(
                "AWS::Budgets::Budget",
                json!({
                    "Budget": {
                        "BudgetLimit": {
                            "Amount": self.budget_amount,
                            "Unit": self.currency,
                        },
                        "BudgetName": "Monthly Budget",
                        "BudgetType": "COST",
                        "TimeUnit": "MONTHLY",
                    },
                    "NotificationsWithSubscribers": [{
                        "Notification": {
                            "Threshold": self.alert_threshold,
                            "NotificationType": "ACTUAL",
                            "ComparisonOperator": "GREATER_THAN",
                            "ThresholdType": "ABSOLUTE_VALUE",
                        },
                        "Subscribers": [{
                            "SubscriptionType": "EMAIL",
                            "Address": self.email,
                        }],
                    }],
                }),
            ),
        );
        template
    }
}
