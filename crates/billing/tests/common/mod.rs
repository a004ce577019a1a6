//! Shared test utilities for billing integration tests
//!
//! These tests need a Postgres database with migrations applied:
//! ```bash
//! export DATABASE_URL="postgres://localhost/docuport_test"
//! cargo test -p docuport-billing -- --ignored
//! ```
//! No live Stripe key is required; the paths under test never leave the
//! database.

#![allow(dead_code)]

use sqlx::PgPool;
use uuid::Uuid;

use docuport_billing::{
    AuthorizationService, BillingGateway, PlanService, QuotaLedger, StripeClient, StripeConfig,
    SubscriptionRecord, SubscriptionService, WebhookProcessor,
};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

pub struct TestServices {
    pub pool: PgPool,
    pub quota: QuotaLedger,
    pub plans: PlanService,
    pub subscriptions: SubscriptionService,
    pub authorization: AuthorizationService,
    pub webhooks: WebhookProcessor,
}

pub async fn setup() -> TestServices {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    // Offline client: these tests never call Stripe
    let stripe = StripeClient::new(StripeConfig {
        secret_key: "sk_test_offline".to_string(),
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        max_carryover: 500,
        usage_report_attempts: 1,
    });
    let gateway = BillingGateway::new(stripe);

    let quota = QuotaLedger::new(pool.clone(), 500);
    let plans = PlanService::new(pool.clone(), gateway.clone());
    let subscriptions = SubscriptionService::new(pool.clone(), gateway.clone(), plans.clone());
    let authorization = AuthorizationService::new(
        pool.clone(),
        quota.clone(),
        subscriptions.clone(),
        plans.clone(),
        gateway.clone(),
        1,
    );
    let webhooks = WebhookProcessor::new(
        pool.clone(),
        plans.clone(),
        subscriptions.clone(),
        quota.clone(),
        TEST_WEBHOOK_SECRET.to_string(),
    );

    TestServices {
        pool,
        quota,
        plans,
        subscriptions,
        authorization,
        webhooks,
    }
}

/// Create a pre-paid test plan with the given free quota
pub async fn create_test_plan(pool: &PgPool, free_quota: i32) -> i32 {
    let name = format!("test-plan-{}", Uuid::new_v4());
    sqlx::query_scalar(
        r#"
        INSERT INTO plans (name, price_cents, free_quota, billing_model, is_active)
        VALUES ($1, 0, $2, 'pre_paid', TRUE)
        RETURNING id
        "#,
    )
    .bind(&name)
    .bind(free_quota)
    .fetch_one(pool)
    .await
    .expect("Failed to create test plan")
}

/// Create an active test subscription anchored at now and return its record
pub async fn create_test_subscription(
    services: &TestServices,
    plan_id: i32,
) -> SubscriptionRecord {
    let user_id = format!("user-{}", Uuid::new_v4());
    let org_id = format!("org-{}", Uuid::new_v4());

    let now = time::OffsetDateTime::now_utc();
    let (period_start, period_end) = docuport_billing::quota::period_window(now, now);

    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id, user_id, org_id, plan_id, status,
            current_period_start, current_period_end
        ) VALUES ($1, $2, $3, $4, 'active', $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&user_id)
    .bind(&org_id)
    .bind(plan_id)
    .bind(period_start)
    .bind(period_end)
    .execute(&services.pool)
    .await
    .expect("Failed to create test subscription");

    services
        .subscriptions
        .get_active(&user_id, &org_id)
        .await
        .expect("Failed to load test subscription")
        .expect("Test subscription should exist")
}

/// Cleanup test data after test completion
pub async fn cleanup(pool: &PgPool, subscription: &SubscriptionRecord) {
    // Delete in order to respect foreign key constraints
    sqlx::query("DELETE FROM usage_quotas WHERE subscription_id = $1")
        .bind(subscription.id)
        .execute(pool)
        .await
        .ok(); // Ignore errors during cleanup

    sqlx::query("DELETE FROM usage_reports WHERE subscription_id = $1")
        .bind(subscription.id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM pending_usage_reports WHERE subscription_id = $1")
        .bind(subscription.id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM one_time_payments WHERE user_id = $1")
        .bind(&subscription.user_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM subscriptions WHERE id = $1")
        .bind(subscription.id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM plans WHERE id = $1")
        .bind(subscription.plan_id)
        .execute(pool)
        .await
        .ok();
}
