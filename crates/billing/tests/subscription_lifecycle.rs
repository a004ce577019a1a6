//! Integration tests for the subscription state machine

mod common;

use docuport_shared::SubscriptionStatus;

#[tokio::test]
#[ignore] // Requires database
async fn test_cancelled_is_terminal() {
    // Given: an active free-plan subscription (no Stripe id, cancel is local)
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let cancelled = services
        .subscriptions
        .cancel(&subscription.user_id, &subscription.org_id)
        .await
        .expect("Cancel failed");
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

    // When: the gateway later claims the subscription is active again
    services
        .subscriptions
        .apply_gateway_status(&cancelled, SubscriptionStatus::Active)
        .await
        .expect("Applying gateway status should not error");

    // Then: the terminal state holds
    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
        .bind(subscription.id)
        .fetch_one(&services.pool)
        .await
        .expect("Failed to read status");
    assert_eq!(status, SubscriptionStatus::Cancelled.to_string());

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_past_due_suspends_and_recovers() {
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    // Payment failure suspends access
    services
        .subscriptions
        .apply_gateway_status(&subscription, SubscriptionStatus::PastDue)
        .await
        .expect("Transition to past_due failed");

    let current = services
        .subscriptions
        .get_current(&subscription.user_id, &subscription.org_id)
        .await
        .expect("Lookup failed")
        .expect("Subscription should exist");
    assert_eq!(current.status, SubscriptionStatus::PastDue);
    assert!(!current.status.grants_access());

    // Recovered payment restores access
    services
        .subscriptions
        .apply_gateway_status(&current, SubscriptionStatus::Active)
        .await
        .expect("Recovery transition failed");

    let recovered = services
        .subscriptions
        .get_active(&subscription.user_id, &subscription.org_id)
        .await
        .expect("Lookup failed")
        .expect("Subscription should be active again");
    assert!(recovered.status.grants_access());

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_invoices_empty_without_stripe_customer() {
    // Given: a user with no subscription at all
    let services = common::setup().await;
    let user_id = format!("user-{}", uuid::Uuid::new_v4());
    let org_id = format!("org-{}", uuid::Uuid::new_v4());

    let invoices = services
        .subscriptions
        .invoices(&user_id, &org_id)
        .await
        .expect("Invoice listing failed");
    assert!(invoices.is_empty());

    // And: a free-plan subscriber, who has no Stripe customer to bill
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let invoices = services
        .subscriptions
        .invoices(&subscription.user_id, &subscription.org_id)
        .await
        .expect("Invoice listing failed");
    assert!(invoices.is_empty());

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_second_active_subscription_rejected() {
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let result = services
        .subscriptions
        .subscribe(
            &subscription.user_id,
            &subscription.org_id,
            "someone@example.com",
            subscription.plan_id,
        )
        .await;

    assert!(
        matches!(result, Err(docuport_billing::BillingError::AlreadySubscribed(_))),
        "Subscribing twice should be rejected, got {:?}",
        result
    );

    common::cleanup(&services.pool, &subscription).await;
}
