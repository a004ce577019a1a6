//! Usage authorization and reporting
//!
//! Single entry point consumed by the upload pipeline. One call shape covers
//! both billing models: `check_and_reserve` before work begins, then
//! `confirm` after success or `release` after failure. Pre-paid plans check
//! and later debit the local quota ledger; metered plans check subscription
//! status only and report the completed work to Stripe afterwards.

use docuport_shared::{BillingModel, SubscriptionStatus};
use serde::Serialize;
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;
use crate::plans::PlanService;
use crate::quota::{QuotaCheck, QuotaLedger};
use crate::subscription::{SubscriptionRecord, SubscriptionService};

/// Why an authorization was denied. Structured so the upload pipeline can
/// render a precise message; denials are results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// No subscription exists for this (user, org); remediated by subscribing
    /// to the free plan
    NoSubscription,
    /// A subscription exists but its status does not grant access
    InactiveSubscription { status: SubscriptionStatus },
    /// Pre-paid only: the current period's ledger cannot cover the batch
    QuotaExceeded { remaining: i32, needed: i32 },
}

/// A granted reservation. The caller must resolve it with `confirm` (work
/// succeeded, charge it) or `release` (work failed, charge nothing).
#[derive(Debug, Clone)]
pub struct UsageAuthorization {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub org_id: String,
    pub operation_count: i32,
    pub billing_model: BillingModel,
    plan_free_quota: i32,
    stripe_item_id: Option<String>,
    /// Minted at reservation time so every confirm retry reuses the same key
    idempotency_key: Uuid,
}

/// Decision returned to the upload pipeline
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Authorized(UsageAuthorization),
    Denied(DenyReason),
}

/// Usage authorization and reporting service
#[derive(Clone)]
pub struct AuthorizationService {
    pool: PgPool,
    quota: QuotaLedger,
    subscriptions: SubscriptionService,
    plans: PlanService,
    gateway: BillingGateway,
    report_attempts: usize,
}

impl AuthorizationService {
    pub fn new(
        pool: PgPool,
        quota: QuotaLedger,
        subscriptions: SubscriptionService,
        plans: PlanService,
        gateway: BillingGateway,
        report_attempts: usize,
    ) -> Self {
        Self {
            pool,
            quota,
            subscriptions,
            plans,
            gateway,
            report_attempts,
        }
    }

    /// Authorize `operation_count` operations for a (user, org) pair.
    ///
    /// All-or-nothing for the batch: either the whole count is authorized or
    /// the call is denied. Never mutates the ledger; the debit happens in
    /// `confirm` once the work actually succeeded.
    pub async fn check_and_reserve(
        &self,
        user_id: &str,
        org_id: &str,
        operation_count: i32,
    ) -> BillingResult<AuthDecision> {
        if operation_count <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Operation count must be positive, got {}",
                operation_count
            )));
        }

        let subscription = match self.subscriptions.get_current(user_id, org_id).await? {
            Some(s) => s,
            None => return Ok(AuthDecision::Denied(DenyReason::NoSubscription)),
        };

        if !subscription.status.grants_access() {
            return Ok(AuthDecision::Denied(DenyReason::InactiveSubscription {
                status: subscription.status,
            }));
        }

        let plan = self.plans.get_plan(subscription.plan_id).await?;

        match plan.billing_model {
            BillingModel::PrePaid => {
                match self
                    .quota
                    .authorize(&subscription, plan.free_quota, operation_count)
                    .await?
                {
                    QuotaCheck::Ok => {}
                    QuotaCheck::Insufficient { remaining, needed } => {
                        return Ok(AuthDecision::Denied(DenyReason::QuotaExceeded {
                            remaining,
                            needed,
                        }));
                    }
                }
            }
            // Metered billing never refuses on volume; it bills after the fact
            BillingModel::Metered => {}
        }

        Ok(AuthDecision::Authorized(UsageAuthorization {
            subscription_id: subscription.id,
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            operation_count,
            billing_model: plan.billing_model,
            plan_free_quota: plan.free_quota,
            stripe_item_id: subscription.stripe_item_id.clone(),
            idempotency_key: Uuid::new_v4(),
        }))
    }

    /// Commit a reservation after the work succeeded.
    ///
    /// Pre-paid: debits the ledger; a concurrent commit may have consumed the
    /// balance since the check, in which case `QuotaExceeded` is returned and
    /// nothing is charged. Metered: reports usage to Stripe; reporting
    /// failures are queued for the worker and never surfaced as an operation
    /// failure.
    pub async fn confirm(&self, auth: &UsageAuthorization) -> BillingResult<Option<DenyReason>> {
        match auth.billing_model {
            BillingModel::PrePaid => self.confirm_prepaid(auth).await,
            BillingModel::Metered => {
                self.confirm_metered(auth).await;
                Ok(None)
            }
        }
    }

    /// Abandon a reservation after the work failed. Nothing was charged at
    /// reservation time, so this is a no-op for both models; it exists to
    /// keep the call shape symmetric for the upload pipeline.
    pub async fn release(&self, auth: &UsageAuthorization) {
        tracing::debug!(
            subscription_id = %auth.subscription_id,
            operation_count = auth.operation_count,
            "Released usage authorization without charge"
        );
    }

    async fn confirm_prepaid(
        &self,
        auth: &UsageAuthorization,
    ) -> BillingResult<Option<DenyReason>> {
        let subscription = self.subscription_for(auth).await?;

        match self
            .quota
            .commit(&subscription, auth.plan_free_quota, auth.operation_count)
            .await?
        {
            QuotaCheck::Ok => Ok(None),
            QuotaCheck::Insufficient { remaining, needed } => {
                Ok(Some(DenyReason::QuotaExceeded { remaining, needed }))
            }
        }
    }

    async fn confirm_metered(&self, auth: &UsageAuthorization) {
        let item_id = match &auth.stripe_item_id {
            Some(id) => id.clone(),
            None => {
                tracing::error!(
                    subscription_id = %auth.subscription_id,
                    "Metered subscription has no Stripe item id, usage not reported"
                );
                return;
            }
        };

        let key = auth.idempotency_key.to_string();
        let quantity = auth.operation_count as u64;

        let strategy = ExponentialBackoff::from_millis(200)
            .map(jitter)
            .take(self.report_attempts);

        let result = Retry::spawn(strategy, || {
            self.gateway.report_usage(&item_id, quantity, &key)
        })
        .await;

        match result {
            Ok(()) => {
                self.record_report(auth, &item_id).await;
            }
            Err(e) => {
                // Reporting failure must never fail or reverse the completed
                // upload; the worker drains the queue later
                tracing::warn!(
                    subscription_id = %auth.subscription_id,
                    error = %e,
                    "Usage report failed after retries, queueing for deferred delivery"
                );
                self.enqueue_report(auth, &item_id).await;
            }
        }
    }

    /// Audit trail of successfully delivered reports.
    async fn record_report(&self, auth: &UsageAuthorization, item_id: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_reports (
                id, subscription_id, stripe_item_id, quantity, idempotency_key
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(auth.subscription_id)
        .bind(item_id)
        .bind(auth.operation_count as i64)
        .bind(auth.idempotency_key)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                subscription_id = %auth.subscription_id,
                error = %e,
                "Failed to store usage report audit record"
            );
        }
    }

    async fn enqueue_report(&self, auth: &UsageAuthorization, item_id: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_usage_reports (
                id, subscription_id, stripe_item_id, quantity, idempotency_key
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(auth.subscription_id)
        .bind(item_id)
        .bind(auth.operation_count as i64)
        .bind(auth.idempotency_key)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            // Last resort: the report is lost unless the error log is acted on
            tracing::error!(
                subscription_id = %auth.subscription_id,
                idempotency_key = %auth.idempotency_key,
                quantity = auth.operation_count,
                error = %e,
                "Failed to queue usage report for deferred delivery"
            );
        }
    }

    async fn subscription_for(&self, auth: &UsageAuthorization) -> BillingResult<SubscriptionRecord> {
        self.subscriptions
            .get_active(&auth.user_id, &auth.org_id)
            .await?
            .filter(|s| s.id == auth.subscription_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(auth.user_id.clone()))
    }
}
