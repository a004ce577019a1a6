//! Subscription lifecycle management
//!
//! Local subscription records mirror the billing gateway's view. Status
//! transitions are driven only by webhook events or an explicit user cancel;
//! every transition goes through [`SubscriptionStatus::can_transition_to`] so
//! the terminal `cancelled` state and the active-only reachability of
//! `past_due`/`unpaid` are enforced in one place.

use docuport_shared::SubscriptionStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{BillingGateway, GatewayInvoice};
use crate::plans::{Plan, PlanService};
use crate::quota::period_window;

/// A subscription row
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub org_id: String,
    pub plan_id: i32,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    /// The Stripe subscription item, set for metered plans and used when
    /// reporting usage
    pub stripe_item_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            org_id: row.try_get("org_id")?,
            plan_id: row.try_get("plan_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_item_id: row.try_get("stripe_item_id")?,
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const INVOICE_PAGE_SIZE: u64 = 10;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, org_id, plan_id, stripe_subscription_id, stripe_customer_id,
    stripe_item_id, status, current_period_start, current_period_end, created_at
"#;

/// Subscription service
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    gateway: BillingGateway,
    plans: PlanService,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, gateway: BillingGateway, plans: PlanService) -> Self {
        Self {
            pool,
            gateway,
            plans,
        }
    }

    /// Get the active subscription for a (user, org) pair, if any.
    /// At most one exists, enforced by a partial unique index.
    pub async fn get_active(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND org_id = $2 AND status = 'active'
            "#
        ))
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Get the most recent non-cancelled subscription for a (user, org) pair.
    /// Used for denial reporting: a past_due subscription is still "theirs",
    /// it just doesn't grant access to new operations.
    pub async fn get_current(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND org_id = $2 AND status != 'cancelled'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    pub async fn get_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Subscribe a user to a plan.
    ///
    /// Free plans activate immediately with no gateway round-trip. Paid plans
    /// create a customer and subscription at the gateway and start `inactive`
    /// until the first `invoice.payment_succeeded` webhook flips them active.
    pub async fn subscribe(
        &self,
        user_id: &str,
        org_id: &str,
        email: &str,
        plan_id: i32,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.plans.get_plan(plan_id).await?;

        if self.get_active(user_id, org_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed(user_id.to_string()));
        }

        if plan.price_cents == 0 && plan.stripe_price_id.is_none() {
            return self.insert_local(user_id, org_id, &plan).await;
        }

        let price_id = plan.stripe_price_id.clone().ok_or_else(|| {
            BillingError::Config(format!("Plan {} has no Stripe price configured", plan.id))
        })?;

        // Online round-trip: gateway failures here surface to the caller,
        // unlike usage reporting
        let customer = self
            .gateway
            .find_or_create_customer(user_id, org_id, email)
            .await?;
        let gateway_sub = self
            .gateway
            .create_subscription(customer.id.as_str(), &price_id, user_id, org_id)
            .await?;

        let subscription: SubscriptionRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, org_id, plan_id, stripe_subscription_id,
                stripe_customer_id, stripe_item_id, status,
                current_period_start, current_period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'inactive', $8, $9)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(org_id)
        .bind(plan.id)
        .bind(&gateway_sub.subscription_id)
        .bind(&gateway_sub.customer_id)
        .bind(&gateway_sub.item_id)
        .bind(gateway_sub.current_period_start)
        .bind(gateway_sub.current_period_end)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %plan.name,
            "Created pending paid subscription"
        );

        Ok(subscription)
    }

    async fn insert_local(
        &self,
        user_id: &str,
        org_id: &str,
        plan: &Plan,
    ) -> BillingResult<SubscriptionRecord> {
        let now = OffsetDateTime::now_utc();
        let (period_start, period_end) = period_window(now, now);

        let subscription: SubscriptionRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, org_id, plan_id, status,
                current_period_start, current_period_end
            ) VALUES ($1, $2, $3, $4, 'active', $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(org_id)
        .bind(plan.id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %plan.name,
            "Created free subscription"
        );

        Ok(subscription)
    }

    /// Cancel the current subscription. Terminal: the record stays forever in
    /// `cancelled` and the user must subscribe again to regain access.
    pub async fn cancel(&self, user_id: &str, org_id: &str) -> BillingResult<SubscriptionRecord> {
        let subscription = self
            .get_current(user_id, org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if let Some(stripe_id) = &subscription.stripe_subscription_id {
            // Online round-trip; failure surfaces so the user can retry
            self.gateway.cancel_at_period_end(stripe_id).await?;
        }

        self.transition(&subscription, SubscriptionStatus::Cancelled)
            .await?;

        let mut cancelled = subscription;
        cancelled.status = SubscriptionStatus::Cancelled;
        Ok(cancelled)
    }

    /// List the caller's Stripe invoice history, most recent first. A user
    /// with no subscription or on a free plan has no Stripe customer and
    /// gets an empty list.
    pub async fn invoices(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> BillingResult<Vec<GatewayInvoice>> {
        let subscription = match self.get_current(user_id, org_id).await? {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let customer_id = match &subscription.stripe_customer_id {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };

        self.gateway.list_invoices(customer_id, INVOICE_PAGE_SIZE).await
    }

    /// Apply a status change driven by a gateway webhook event. Disallowed
    /// transitions (anything out of `cancelled`, billing-failure states from
    /// non-active) are logged and ignored rather than treated as errors, since
    /// webhooks arrive at-least-once and out of order.
    pub async fn apply_gateway_status(
        &self,
        subscription: &SubscriptionRecord,
        new_status: SubscriptionStatus,
    ) -> BillingResult<()> {
        if subscription.status == new_status {
            return Ok(());
        }

        if !subscription.status.can_transition_to(new_status) {
            tracing::warn!(
                subscription_id = %subscription.id,
                from = %subscription.status,
                to = %new_status,
                "Ignoring disallowed subscription transition from webhook"
            );
            return Ok(());
        }

        self.transition(subscription, new_status).await
    }

    async fn transition(
        &self,
        subscription: &SubscriptionRecord,
        new_status: SubscriptionStatus,
    ) -> BillingResult<()> {
        if !subscription.status.can_transition_to(new_status) {
            return Err(BillingError::SubscriptionCancelled);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(new_status.to_string())
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            from = %subscription.status,
            to = %new_status,
            "Subscription status transition"
        );

        Ok(())
    }

    /// Mark a subscription active and refresh its period bounds. Called from
    /// the webhook processor on a successful payment.
    pub async fn activate_with_period(
        &self,
        subscription: &SubscriptionRecord,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        if !subscription
            .status
            .can_transition_to(SubscriptionStatus::Active)
            && subscription.status != SubscriptionStatus::Active
        {
            tracing::warn!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Ignoring payment success for subscription that cannot activate"
            );
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                current_period_start = $1,
                current_period_end = $2,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            period_start = %period_start,
            period_end = %period_end,
            "Activated subscription and refreshed period bounds"
        );

        Ok(())
    }

    /// Advance the stored period bounds to the window containing now.
    /// Used by the worker rollover job for locally-managed pre-paid plans.
    pub async fn renew_period(&self, subscription: &SubscriptionRecord) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let (period_start, period_end) = period_window(subscription.current_period_start, now);

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_start = $1,
                current_period_end = $2,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .bind(subscription.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All active pre-paid subscriptions whose stored period has lapsed.
    pub async fn due_for_rollover(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let subscriptions: Vec<SubscriptionRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions s
            WHERE s.status = 'active'
              AND s.current_period_end <= NOW()
              AND EXISTS (
                  SELECT 1 FROM plans p
                  WHERE p.id = s.plan_id AND p.billing_model = 'pre_paid'
              )
            ORDER BY s.current_period_end ASC
            LIMIT 100
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }
}
