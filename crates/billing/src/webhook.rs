//! Webhook event processor
//!
//! Validates, deduplicates, and applies inbound Stripe events to local state.
//! Signature verification happens before anything else touches the payload
//! (fail closed), and every event id is recorded so at-least-once delivery
//! cannot apply an effect twice. Unrecognized event kinds are acknowledged
//! and ignored so Stripe does not retry-storm on events we don't care about.
//!
//! Signature verification is done by hand with hmac/sha2 rather than through
//! async-stripe's `Webhook` helper, which rejects newer API versions.

use docuport_shared::SubscriptionStatus;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanService;
use crate::quota::QuotaLedger;
use crate::subscription::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed age of a signed payload, limiting replay of captured
/// requests. Matches Stripe's recommended default.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What happened to an accepted event. All three acknowledge with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Event applied to local state
    Processed,
    /// Event id seen before; no additional state change
    Duplicate,
    /// Event kind this system doesn't care about
    Ignored,
}

/// A decoded webhook event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: String,
    pub object: Value,
}

impl WebhookEvent {
    /// Decode the event envelope. Only the fields we route on are required.
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::InvalidInput(format!("Malformed event payload: {}", e)))?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("Event missing id".to_string()))?
            .to_string();
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("Event missing type".to_string()))?
            .to_string();
        let object = value
            .pointer("/data/object")
            .cloned()
            .unwrap_or(Value::Null);

        Ok(Self { id, kind, object })
    }
}

/// Verify a `Stripe-Signature` header against the payload.
///
/// Header format: `t=<unix ts>,v1=<hex hmac>[,v1=...]`. The signed message is
/// `"{t}.{payload}"`. Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if candidates.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    for candidate in &candidates {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::Internal("HMAC initialization failed".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}

/// Webhook processor service
#[derive(Clone)]
pub struct WebhookProcessor {
    pool: PgPool,
    plans: PlanService,
    subscriptions: SubscriptionService,
    quota: QuotaLedger,
    webhook_secret: String,
}

impl WebhookProcessor {
    pub fn new(
        pool: PgPool,
        plans: PlanService,
        subscriptions: SubscriptionService,
        quota: QuotaLedger,
        webhook_secret: String,
    ) -> Self {
        Self {
            pool,
            plans,
            subscriptions,
            quota,
            webhook_secret,
        }
    }

    /// Verify, deduplicate, and apply one raw event delivery.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> BillingResult<WebhookDisposition> {
        verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .map_err(|e| {
            // Security event: a payload failed verification
            tracing::warn!("Rejected webhook with invalid signature");
            e
        })?;

        let event = WebhookEvent::parse(payload)?;

        if !self.mark_processed(&event).await? {
            tracing::info!(event_id = %event.id, kind = %event.kind, "Skipping replayed webhook event");
            return Ok(WebhookDisposition::Duplicate);
        }

        match self.apply(&event).await {
            Ok(disposition) => Ok(disposition),
            Err(e) => {
                // The error propagates as a non-200 so Stripe redelivers; the
                // dedup mark must go with it or the redelivery would be
                // swallowed as a duplicate and the effect lost for good
                self.unmark_processed(&event).await;
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &WebhookEvent) -> BillingResult<WebhookDisposition> {
        match event.kind.as_str() {
            "payment_intent.succeeded" => self.handle_payment_intent_succeeded(event).await,
            "invoice.payment_succeeded" => self.handle_invoice_payment_succeeded(event).await,
            "customer.subscription.updated" => self.handle_subscription_updated(event).await,
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,
            kind if kind.starts_with("product.") || kind.starts_with("price.") => {
                self.plans.mark_catalog_stale().await?;
                Ok(WebhookDisposition::Processed)
            }
            kind => {
                tracing::info!(event_id = %event.id, kind = %kind, "Ignoring unhandled webhook event kind");
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    /// Record the event id. Returns false when it was already recorded, in
    /// which case the caller must apply nothing.
    async fn mark_processed(&self, event: &WebhookEvent) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.kind)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    /// Remove the dedup record for an event whose handler failed.
    async fn unmark_processed(&self, event: &WebhookEvent) {
        if let Err(e) = sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(&event.id)
            .execute(&self.pool)
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to clear dedup record for failed webhook event"
            );
        }
    }

    /// One-time quota purchase completed. The quota credit itself is also
    /// idempotent per payment intent id, so a replay that slips past the
    /// event-id dedup still cannot double-credit.
    async fn handle_payment_intent_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookDisposition> {
        let metadata = &event.object["metadata"];
        let (user_id, org_id) = match (
            metadata.get("user_id").and_then(Value::as_str),
            metadata.get("org_id").and_then(Value::as_str),
        ) {
            (Some(u), Some(o)) => (u, o),
            _ => {
                // Payment intent not minted by us (e.g. subscription invoices)
                return Ok(WebhookDisposition::Ignored);
            }
        };

        let quota_purchased: i32 = match metadata
            .get("quota_purchased")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
        {
            Some(q) => q,
            None => return Ok(WebhookDisposition::Ignored),
        };

        let intent_id = event
            .object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("Payment intent missing id".to_string()))?;
        let amount_cents = event
            .object
            .get("amount")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let description = event.object.get("description").and_then(Value::as_str);

        let subscription = match self.subscriptions.get_active(user_id, org_id).await? {
            Some(s) => s,
            None => {
                tracing::warn!(
                    user_id = %user_id,
                    org_id = %org_id,
                    "One-time payment for user without active subscription, not credited"
                );
                return Ok(WebhookDisposition::Ignored);
            }
        };

        let plan = self.plans.get_plan(subscription.plan_id).await?;
        self.quota
            .add_one_time_quota(
                &subscription,
                plan.free_quota,
                quota_purchased,
                amount_cents,
                intent_id,
                description,
            )
            .await?;

        Ok(WebhookDisposition::Processed)
    }

    /// A subscription invoice was paid: activate and refresh period bounds.
    async fn handle_invoice_payment_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookDisposition> {
        let stripe_subscription_id = match event.object.get("subscription").and_then(Value::as_str)
        {
            Some(id) => id,
            // One-off invoices carry no subscription
            None => return Ok(WebhookDisposition::Ignored),
        };

        let subscription = match self
            .subscriptions
            .get_by_stripe_id(stripe_subscription_id)
            .await?
        {
            Some(s) => s,
            None => {
                tracing::warn!(
                    stripe_subscription_id = %stripe_subscription_id,
                    "Invoice payment for unknown subscription"
                );
                return Ok(WebhookDisposition::Ignored);
            }
        };

        let period_start = unix_field(&event.object, "period_start")
            .unwrap_or(subscription.current_period_start);
        let period_end =
            unix_field(&event.object, "period_end").unwrap_or(subscription.current_period_end);

        self.subscriptions
            .activate_with_period(&subscription, period_start, period_end)
            .await?;

        Ok(WebhookDisposition::Processed)
    }

    /// Sync local status from the gateway's status field.
    async fn handle_subscription_updated(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookDisposition> {
        let stripe_subscription_id = event
            .object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("Subscription missing id".to_string()))?;

        let subscription = match self
            .subscriptions
            .get_by_stripe_id(stripe_subscription_id)
            .await?
        {
            Some(s) => s,
            None => return Ok(WebhookDisposition::Ignored),
        };

        let stripe_status = event
            .object
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("");

        let new_status = match map_stripe_status(stripe_status) {
            Some(status) => status,
            None => {
                tracing::info!(
                    stripe_subscription_id = %stripe_subscription_id,
                    stripe_status = %stripe_status,
                    "No local mapping for Stripe subscription status"
                );
                return Ok(WebhookDisposition::Ignored);
            }
        };

        self.subscriptions
            .apply_gateway_status(&subscription, new_status)
            .await?;

        Ok(WebhookDisposition::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookDisposition> {
        let stripe_subscription_id = event
            .object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidInput("Subscription missing id".to_string()))?;

        let subscription = match self
            .subscriptions
            .get_by_stripe_id(stripe_subscription_id)
            .await?
        {
            Some(s) => s,
            None => return Ok(WebhookDisposition::Ignored),
        };

        self.subscriptions
            .apply_gateway_status(&subscription, SubscriptionStatus::Cancelled)
            .await?;

        Ok(WebhookDisposition::Processed)
    }
}

/// Map Stripe's subscription status vocabulary onto ours. Statuses with no
/// sensible local meaning (trialing is treated as active, incomplete as
/// pending) return None only for values we have never seen.
fn map_stripe_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" | "trialing" => Some(SubscriptionStatus::Active),
        "incomplete" | "incomplete_expired" | "paused" => Some(SubscriptionStatus::Inactive),
        "past_due" => Some(SubscriptionStatus::PastDue),
        "unpaid" => Some(SubscriptionStatus::Unpaid),
        "canceled" | "cancelled" => Some(SubscriptionStatus::Cancelled),
        _ => None,
    }
}

fn unix_field(object: &Value, field: &str) -> Option<OffsetDateTime> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature_accepts_valid() {
        let payload = br#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_test", 1_700_000_000).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_wrong_secret() {
        let payload = br#"{"id":"evt_1","type":"x"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(matches!(
            verify_signature(payload, &header, "whsec_other", 1_700_000_000),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_verify_signature_rejects_tampered_payload() {
        let payload = br#"{"id":"evt_1","type":"x"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_signature(
            br#"{"id":"evt_2","type":"x"}"#,
            &header,
            "whsec_test",
            1_700_000_000
        )
        .is_err());
    }

    #[test]
    fn test_verify_signature_rejects_stale_timestamp() {
        let payload = b"{}";
        let header = sign(payload, "whsec_test", 1_700_000_000);
        let later = 1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1;
        assert!(verify_signature(payload, &header, "whsec_test", later).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_garbage_header() {
        assert!(verify_signature(b"{}", "not-a-signature", "whsec_test", 0).is_err());
        assert!(verify_signature(b"{}", "t=123", "whsec_test", 123).is_err());
        assert!(verify_signature(b"{}", "v1=abcd", "whsec_test", 0).is_err());
    }

    #[test]
    fn test_parse_event_envelope() {
        let payload = br#"{
            "id": "evt_123",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_9", "status": "past_due" } }
        }"#;
        let event = WebhookEvent::parse(payload).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.kind, "customer.subscription.updated");
        assert_eq!(event.object["status"], "past_due");
    }

    #[test]
    fn test_parse_event_requires_id_and_type() {
        assert!(WebhookEvent::parse(br#"{"type":"x"}"#).is_err());
        assert!(WebhookEvent::parse(br#"{"id":"evt_1"}"#).is_err());
        assert!(WebhookEvent::parse(b"not json").is_err());
    }

    #[test]
    fn test_map_stripe_status() {
        assert_eq!(map_stripe_status("active"), Some(SubscriptionStatus::Active));
        assert_eq!(map_stripe_status("trialing"), Some(SubscriptionStatus::Active));
        assert_eq!(map_stripe_status("past_due"), Some(SubscriptionStatus::PastDue));
        assert_eq!(map_stripe_status("canceled"), Some(SubscriptionStatus::Cancelled));
        assert_eq!(map_stripe_status("incomplete"), Some(SubscriptionStatus::Inactive));
        assert_eq!(map_stripe_status("who_knows"), None);
    }
}
