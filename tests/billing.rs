use pipeline_composer::billing::{BillingDefinition, DEFAULT_ALERT_THRESHOLD};

#[test]
fn budget_alerts_on_fixed_threshold() {
    let template = BillingDefinition::new(50.0, "ops@example.com").template();
    let budget = template.resource("Budget").unwrap();
    assert_eq!(budget.kind, "AWS::Budgets::Budget");

    let props = &budget.properties;
    assert_eq!(props["Budget"]["BudgetLimit"]["Amount"], 50.0);
    assert_eq!(props["Budget"]["BudgetLimit"]["Unit"], "USD");
    assert_eq!(props["Budget"]["TimeUnit"], "MONTHLY");
    assert_eq!(props["Budget"]["BudgetType"], "COST");

    let notifications = props["NotificationsWithSubscribers"].as_array().unwrap();
    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0]["Notification"];
    assert_eq!(notification["Threshold"], DEFAULT_ALERT_THRESHOLD);
    assert_eq!(notification["ThresholdType"], "ABSOLUTE_VALUE");
    assert_eq!(notification["ComparisonOperator"], "GREATER_THAN");

    let subscribers = notifications[0]["Subscribers"].as_array().unwrap();
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0]["SubscriptionType"], "EMAIL");
    assert_eq!(subscribers[0]["Address"], "ops@example.com");
}

#[test]
fn threshold_and_currency_are_configurable() {
    let billing = BillingDefinition::new(100.0, "ops@example.com")
        .with_alert_threshold(80.0)
        .with_currency("EUR")
        .with_stack_name("CostStack");
    assert_eq!(billing.template_file(), "CostStack.template.json");

    let template = billing.template();
    let props = &template.resource("Budget").unwrap().properties;
    assert_eq!(
        props["NotificationsWithSubscribers"][0]["Notification"]["Threshold"],
        80.0
    );
    assert_eq!(props["Budget"]["BudgetLimit"]["Unit"], "EUR");
}
