//! Integration tests for the usage authorization service
//!
//! Exercises the check/confirm/release call shape the upload pipeline uses,
//! including every structured denial reason, against a real Postgres instance.

mod common;

use docuport_billing::{AuthDecision, DenyReason};
use docuport_shared::SubscriptionStatus;
use uuid::Uuid;

#[tokio::test]
#[ignore] // Requires database
async fn test_no_subscription_is_denied() {
    // Given: a (user, org) pair that never subscribed
    let services = common::setup().await;
    let user_id = format!("user-{}", Uuid::new_v4());
    let org_id = format!("org-{}", Uuid::new_v4());

    // When: a single operation is checked
    let decision = services
        .authorization
        .check_and_reserve(&user_id, &org_id, 1)
        .await
        .expect("Authorization check failed");

    // Then: denied with the remediable reason
    match decision {
        AuthDecision::Denied(DenyReason::NoSubscription) => {}
        other => panic!("Expected NoSubscription denial, got {:?}", other),
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn test_prepaid_reserve_confirm_debits_once() {
    // Given: an active pre-paid subscription with 20 operations per month
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    // When: 5 operations are reserved and confirmed
    let decision = services
        .authorization
        .check_and_reserve(&subscription.user_id, &subscription.org_id, 5)
        .await
        .expect("Authorization check failed");
    let auth = match decision {
        AuthDecision::Authorized(auth) => auth,
        AuthDecision::Denied(reason) => panic!("Expected authorization, got {:?}", reason),
    };

    let denial = services
        .authorization
        .confirm(&auth)
        .await
        .expect("Confirm failed");
    assert_eq!(denial, None);

    // Then: the debit is visible to the next check, all-or-nothing
    let decision = services
        .authorization
        .check_and_reserve(&subscription.user_id, &subscription.org_id, 16)
        .await
        .expect("Authorization check failed");
    match decision {
        AuthDecision::Denied(DenyReason::QuotaExceeded { remaining, needed }) => {
            assert_eq!(remaining, 15);
            assert_eq!(needed, 16);
        }
        other => panic!("Expected QuotaExceeded denial, got {:?}", other),
    }

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_release_charges_nothing() {
    // Given: a reservation for the entire monthly quota
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let decision = services
        .authorization
        .check_and_reserve(&subscription.user_id, &subscription.org_id, 20)
        .await
        .expect("Authorization check failed");
    let auth = match decision {
        AuthDecision::Authorized(auth) => auth,
        AuthDecision::Denied(reason) => panic!("Expected authorization, got {:?}", reason),
    };

    // When: the work fails and the reservation is released
    services.authorization.release(&auth).await;

    // Then: the full quota is still available
    let decision = services
        .authorization
        .check_and_reserve(&subscription.user_id, &subscription.org_id, 20)
        .await
        .expect("Authorization check failed");
    assert!(matches!(decision, AuthDecision::Authorized(_)));

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_suspended_subscription_is_denied() {
    // Given: an active subscription pushed to past_due by the gateway
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    services
        .subscriptions
        .apply_gateway_status(&subscription, SubscriptionStatus::PastDue)
        .await
        .expect("Status transition failed");

    // When: any operation is checked
    let decision = services
        .authorization
        .check_and_reserve(&subscription.user_id, &subscription.org_id, 1)
        .await
        .expect("Authorization check failed");

    // Then: denied with the suspended status, quota untouched
    match decision {
        AuthDecision::Denied(DenyReason::InactiveSubscription { status }) => {
            assert_eq!(status, SubscriptionStatus::PastDue);
        }
        other => panic!("Expected InactiveSubscription denial, got {:?}", other),
    }

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_zero_count_is_rejected() {
    let services = common::setup().await;
    let user_id = format!("user-{}", Uuid::new_v4());
    let org_id = format!("org-{}", Uuid::new_v4());

    let result = services
        .authorization
        .check_and_reserve(&user_id, &org_id, 0)
        .await;

    assert!(matches!(
        result,
        Err(docuport_billing::BillingError::InvalidInput(_))
    ));
}
