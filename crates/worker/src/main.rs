//! DocuPort background worker
//!
//! Runs the recurring billing jobs: deferred usage report delivery, billing
//! period rollover, and queue retention cleanup.

mod report_processor;
mod rollover;

use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docuport_billing::{BillingGateway, PlanService, QuotaLedger, StripeClient, SubscriptionService};

const REPORT_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docuport_worker=info,docuport_billing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = docuport_shared::db::create_pool(&database_url).await?;

    let stripe = StripeClient::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to initialize Stripe client: {}", e))?;
    let max_carryover = stripe.config().max_carryover;
    let gateway = BillingGateway::new(stripe);

    let quota = QuotaLedger::new(pool.clone(), max_carryover);
    let plans = PlanService::new(pool.clone(), gateway.clone());
    let subscriptions = SubscriptionService::new(pool.clone(), gateway.clone(), plans.clone());

    let scheduler = JobScheduler::new().await?;

    // Deferred usage reports: every minute
    {
        let pool = pool.clone();
        let gateway = gateway.clone();
        scheduler
            .add(Job::new_async("0 * * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                let gateway = gateway.clone();
                Box::pin(async move {
                    report_processor::process_report_queue(&pool, &gateway).await;
                })
            })?)
            .await?;
    }

    // Period rollover: every 15 minutes
    {
        let subscriptions = subscriptions.clone();
        let plans = plans.clone();
        let quota = quota.clone();
        scheduler
            .add(Job::new_async("0 */15 * * * *", move |_uuid, _lock| {
                let subscriptions = subscriptions.clone();
                let plans = plans.clone();
                let quota = quota.clone();
                Box::pin(async move {
                    rollover::roll_over_lapsed_periods(&subscriptions, &plans, &quota).await;
                })
            })?)
            .await?;
    }

    // Queue retention cleanup: daily at 03:00
    {
        let pool = pool.clone();
        scheduler
            .add(Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    report_processor::cleanup_old_reports(&pool, REPORT_RETENTION_DAYS).await;
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    tracing::info!("DocuPort worker started");

    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}
