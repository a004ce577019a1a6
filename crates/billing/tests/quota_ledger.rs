//! Integration tests for the quota ledger
//!
//! Covers ledger arithmetic, denial semantics, concurrent commits, carryover,
//! and one-time purchase idempotency against a real Postgres instance.

mod common;

use docuport_billing::QuotaCheck;

#[tokio::test]
#[ignore] // Requires database
async fn test_free_plan_month_scenario() {
    // Given: a 20-per-month plan with 15 already used
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let committed = services
        .quota
        .commit(&subscription, 20, 15)
        .await
        .expect("Initial commit failed");
    assert_eq!(committed, QuotaCheck::Ok);

    // When: a batch of 6 is checked
    let denied = services
        .quota
        .authorize(&subscription, 20, 6)
        .await
        .expect("Authorize failed");

    // Then: denied all-or-nothing with the actual balance
    assert_eq!(
        denied,
        QuotaCheck::Insufficient {
            remaining: 5,
            needed: 6
        }
    );

    // A batch of 5 fits exactly and drains the period
    let allowed = services
        .quota
        .authorize(&subscription, 20, 5)
        .await
        .expect("Authorize failed");
    assert_eq!(allowed, QuotaCheck::Ok);

    let committed = services
        .quota
        .commit(&subscription, 20, 5)
        .await
        .expect("Commit failed");
    assert_eq!(committed, QuotaCheck::Ok);

    let quota = services
        .quota
        .current_period(&subscription, 20)
        .await
        .expect("Failed to read quota");
    assert_eq!(quota.quota_used, 20);
    assert_eq!(quota.quota_remaining, 0);
    assert_eq!(quota.quota_limit, 20);

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_authorize_never_mutates_ledger() {
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 10).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    for _ in 0..5 {
        services
            .quota
            .authorize(&subscription, 10, 3)
            .await
            .expect("Authorize failed");
    }

    let quota = services
        .quota
        .current_period(&subscription, 10)
        .await
        .expect("Failed to read quota");
    assert_eq!(quota.quota_used, 0);
    assert_eq!(quota.quota_remaining, 10);

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_commits_single_winner() {
    // Given: one unit remaining
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    services
        .quota
        .commit(&subscription, 20, 19)
        .await
        .expect("Setup commit failed");

    // When: two commits race for it
    let quota_a = services.quota.clone();
    let quota_b = services.quota.clone();
    let sub_a = subscription.clone();
    let sub_b = subscription.clone();

    let (first, second) = tokio::join!(
        quota_a.commit(&sub_a, 20, 1),
        quota_b.commit(&sub_b, 20, 1)
    );
    let first = first.expect("First commit errored");
    let second = second.expect("Second commit errored");

    // Then: exactly one wins and the counter never goes negative
    let outcomes = [first, second];
    let wins = outcomes.iter().filter(|o| **o == QuotaCheck::Ok).count();
    assert_eq!(wins, 1, "Exactly one concurrent commit should succeed");

    let quota = services
        .quota
        .current_period(&subscription, 20)
        .await
        .expect("Failed to read quota");
    assert_eq!(quota.quota_remaining, 0);
    assert_eq!(quota.quota_used, 20);

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_rollover_carries_unused_quota() {
    // Given: a period with 10 of 150 remaining, already lapsed
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 150).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    services
        .quota
        .commit(&subscription, 150, 140)
        .await
        .expect("Setup commit failed");

    // Age the row into the previous period, ending exactly where the
    // current one starts so the carryover lookup finds it
    sqlx::query(
        r#"
        UPDATE usage_quotas
        SET period_end = $2,
            period_start = $2 - INTERVAL '1 month'
        WHERE subscription_id = $1
        "#,
    )
    .bind(subscription.id)
    .bind(subscription.current_period_start)
    .execute(&services.pool)
    .await
    .expect("Failed to age quota period");

    // When: the next period is created
    let next = services
        .quota
        .roll_over(&subscription, 150)
        .await
        .expect("Rollover failed");

    // Then: the 10 unused units carry into the new limit
    assert_eq!(next.carryover_from_previous, 10);
    assert_eq!(next.quota_limit, 160);
    assert_eq!(next.quota_used, 0);
    assert_eq!(next.quota_remaining, 160);

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_carryover_is_capped() {
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 2000).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    // Leave 2000 unused, far above the 500 cap
    services
        .quota
        .current_period(&subscription, 2000)
        .await
        .expect("Failed to create period");

    sqlx::query(
        r#"
        UPDATE usage_quotas
        SET period_end = $2,
            period_start = $2 - INTERVAL '1 month'
        WHERE subscription_id = $1
        "#,
    )
    .bind(subscription.id)
    .bind(subscription.current_period_start)
    .execute(&services.pool)
    .await
    .expect("Failed to age quota period");

    let next = services
        .quota
        .roll_over(&subscription, 2000)
        .await
        .expect("Rollover failed");

    assert_eq!(next.carryover_from_previous, 500);
    assert_eq!(next.quota_limit, 2500);

    common::cleanup(&services.pool, &subscription).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_one_time_purchase_credits_once() {
    // Given: a subscription and a paid quota top-up
    let services = common::setup().await;
    let plan_id = common::create_test_plan(&services.pool, 20).await;
    let subscription = common::create_test_subscription(&services, plan_id).await;

    let intent_id = format!("pi_test_{}", uuid::Uuid::new_v4());

    // When: the same payment intent is applied twice (webhook redelivery)
    let first = services
        .quota
        .add_one_time_quota(&subscription, 20, 50, 999, &intent_id, Some("50 uploads"))
        .await
        .expect("First credit failed");
    let second = services
        .quota
        .add_one_time_quota(&subscription, 20, 50, 999, &intent_id, Some("50 uploads"))
        .await
        .expect("Replay errored");

    // Then: only the first application credits
    assert!(first, "First application should credit");
    assert!(!second, "Replay should be a no-op");

    let quota = services
        .quota
        .current_period(&subscription, 20)
        .await
        .expect("Failed to read quota");
    assert_eq!(quota.quota_limit, 70);
    assert_eq!(quota.quota_remaining, 70);

    common::cleanup(&services.pool, &subscription).await;
}
