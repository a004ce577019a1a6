//! Usage summaries for the current billing period
//!
//! Pre-paid plans read the live quota row. Metered plans sum the local
//! audit trail of reported usage records, which tracks what has been
//! pushed (or queued to push) to the gateway for the open period.

use serde::Serialize;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;

use docuport_shared::BillingModel;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanService;
use crate::quota::QuotaLedger;
use crate::subscription::{SubscriptionRecord, SubscriptionService};

/// Current-period usage snapshot for one subscription
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub plan_name: String,
    pub billing_model: BillingModel,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub used: i32,
    /// None for metered plans, which have no volume ceiling
    pub quota_limit: Option<i32>,
    pub remaining: Option<i32>,
    pub carryover_from_previous: Option<i32>,
}

/// Usage reporting service
#[derive(Clone)]
pub struct UsageService {
    pool: PgPool,
    subscriptions: SubscriptionService,
    plans: PlanService,
    quota: QuotaLedger,
}

impl UsageService {
    pub fn new(
        pool: PgPool,
        subscriptions: SubscriptionService,
        plans: PlanService,
        quota: QuotaLedger,
    ) -> Self {
        Self {
            pool,
            subscriptions,
            plans,
            quota,
        }
    }

    /// Summarize the current period for a user's subscription.
    pub async fn current_usage(&self, user_id: &str, org_id: &str) -> BillingResult<UsageSummary> {
        let subscription = self
            .subscriptions
            .get_current(user_id, org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let plan = self.plans.get_plan(subscription.plan_id).await?;

        match plan.billing_model {
            BillingModel::PrePaid => {
                let period = self
                    .quota
                    .current_period(&subscription, plan.free_quota)
                    .await?;
                Ok(UsageSummary {
                    plan_name: plan.name,
                    billing_model: BillingModel::PrePaid,
                    period_start: period.period_start,
                    period_end: period.period_end,
                    used: period.quota_used,
                    quota_limit: Some(period.quota_limit),
                    remaining: Some(period.quota_remaining),
                    carryover_from_previous: Some(period.carryover_from_previous),
                })
            }
            BillingModel::Metered => {
                let used = self.metered_usage(&subscription).await?;
                Ok(UsageSummary {
                    plan_name: plan.name,
                    billing_model: BillingModel::Metered,
                    period_start: subscription.current_period_start,
                    period_end: subscription.current_period_end,
                    used,
                    quota_limit: None,
                    remaining: None,
                    carryover_from_previous: None,
                })
            }
        }
    }

    /// Sum reported and still-pending units inside the subscription's
    /// current period. Pending units count because the gateway will
    /// eventually receive them.
    async fn metered_usage(&self, subscription: &SubscriptionRecord) -> BillingResult<i32> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE((
                    SELECT SUM(quantity) FROM usage_reports
                    WHERE subscription_id = $1
                      AND reported_at >= $2 AND reported_at < $3
                ), 0)::BIGINT AS reported,
                COALESCE((
                    SELECT SUM(quantity) FROM pending_usage_reports
                    WHERE subscription_id = $1
                      AND status != 'completed'
                      AND created_at >= $2 AND created_at < $3
                ), 0)::BIGINT AS pending
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .fetch_one(&self.pool)
        .await?;

        let reported: i64 = row.try_get("reported")?;
        let pending: i64 = row.try_get("pending")?;

        Ok((reported + pending).min(i32::MAX as i64) as i32)
    }
}
