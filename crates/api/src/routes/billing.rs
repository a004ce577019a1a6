//! Billing routes: plan catalog, subscription lifecycle, usage

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use docuport_billing::{GatewayInvoice, Plan, SubscriptionRecord, UsageSummary};
use docuport_shared::{BillingModel, SubscriptionStatus};

use crate::{
    error::{ApiError, ApiResult},
    routes::Caller,
    state::AppState,
};

/// Plan catalog entry
#[derive(Debug, Serialize)]
pub struct PlanInfo {
    pub id: i32,
    pub name: String,
    pub price_cents: i64,
    pub free_quota: i32,
    pub billing_model: BillingModel,
}

impl From<Plan> for PlanInfo {
    fn from(plan: Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name,
            price_cents: plan.price_cents,
            free_quota: plan.free_quota,
            billing_model: plan.billing_model,
        }
    }
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub plan_id: i32,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
}

impl From<SubscriptionRecord> for SubscriptionInfo {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            plan_id: record.plan_id,
            status: record.status,
            current_period_start: record.current_period_start,
            current_period_end: record.current_period_end,
        }
    }
}

/// Invoice history entry
#[derive(Debug, Serialize)]
pub struct InvoiceInfo {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

impl From<GatewayInvoice> for InvoiceInfo {
    fn from(invoice: GatewayInvoice) -> Self {
        Self {
            id: invoice.invoice_id,
            number: invoice.number,
            status: invoice.status,
            amount_due_cents: invoice.amount_due_cents,
            amount_paid_cents: invoice.amount_paid_cents,
            currency: invoice.currency,
            created: invoice.created,
            hosted_invoice_url: invoice.hosted_invoice_url,
            invoice_pdf: invoice.invoice_pdf,
        }
    }
}

/// Request to subscribe to a plan
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: i32,
}

/// List active plans, refreshing from the Stripe catalog when stale
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanInfo>>> {
    let plans = state.billing.plans.list_active_plans().await?;
    Ok(Json(plans.into_iter().map(PlanInfo::from).collect()))
}

/// Get the caller's current subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<SubscriptionInfo>> {
    let subscription = state
        .billing
        .subscriptions
        .get_current(&caller.user_id, &caller.org_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(SubscriptionInfo::from(subscription)))
}

/// Get the caller's current-period usage summary
pub async fn get_usage(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<UsageSummary>> {
    let summary = state
        .billing
        .usage
        .current_usage(&caller.user_id, &caller.org_id)
        .await?;

    Ok(Json(summary))
}

/// List the caller's Stripe invoice history
pub async fn list_invoices(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<InvoiceInfo>>> {
    let invoices = state
        .billing
        .subscriptions
        .invoices(&caller.user_id, &caller.org_id)
        .await?;

    Ok(Json(invoices.into_iter().map(InvoiceInfo::from).collect()))
}

/// Subscribe the caller to a plan
pub async fn subscribe(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscriptionInfo>> {
    // Paid plans create a Stripe customer keyed by email
    let email = caller
        .email
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("x-user-email header is required".to_string()))?;

    let subscription = state
        .billing
        .subscriptions
        .subscribe(&caller.user_id, &caller.org_id, email, req.plan_id)
        .await?;

    tracing::info!(
        user_id = %caller.user_id,
        org_id = %caller.org_id,
        plan_id = req.plan_id,
        "Subscription created"
    );

    Ok(Json(SubscriptionInfo::from(subscription)))
}

/// Cancel the caller's subscription at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<SubscriptionInfo>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel(&caller.user_id, &caller.org_id)
        .await?;

    tracing::info!(
        user_id = %caller.user_id,
        org_id = %caller.org_id,
        "Subscription cancelled"
    );

    Ok(Json(SubscriptionInfo::from(subscription)))
}
