//! Stripe webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::json;

use docuport_billing::WebhookDisposition;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Receive a Stripe webhook event.
///
/// Signature failures return 400 so Stripe surfaces the misconfiguration.
/// Duplicates and unhandled event kinds return 200 to stop redelivery.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidWebhookSignature)?;

    let disposition = state.billing.webhooks.handle(&body, signature).await?;

    let status = match disposition {
        WebhookDisposition::Processed => "processed",
        WebhookDisposition::Duplicate => "duplicate",
        WebhookDisposition::Ignored => "ignored",
    };

    Ok((StatusCode::OK, Json(json!({ "status": status }))))
}
