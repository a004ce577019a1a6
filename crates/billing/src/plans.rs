//! Plan registry
//!
//! The `plans` table is authoritative for pre-paid plans and acts as a cache
//! of the Stripe product catalog for metered plans. Catalog-change webhook
//! events mark the cached rows stale; the next read refreshes them from the
//! gateway.

use docuport_shared::BillingModel;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;

/// A subscription plan
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: i32,
    pub name: String,
    pub stripe_price_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub price_cents: i64,
    /// Operations included per billing period
    pub free_quota: i32,
    pub billing_model: BillingModel,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Plan {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let billing_model: String = row.try_get("billing_model")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            stripe_price_id: row.try_get("stripe_price_id")?,
            stripe_product_id: row.try_get("stripe_product_id")?,
            price_cents: row.try_get("price_cents")?,
            free_quota: row.try_get("free_quota")?,
            billing_model: billing_model
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const PLAN_COLUMNS: &str = r#"
    id, name, stripe_price_id, stripe_product_id, price_cents, free_quota,
    billing_model, is_active, created_at
"#;

/// Plan registry service
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
    gateway: BillingGateway,
}

impl PlanService {
    pub fn new(pool: PgPool, gateway: BillingGateway) -> Self {
        Self { pool, gateway }
    }

    pub async fn get_plan(&self, plan_id: i32) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(&format!(
            r#"
            SELECT {PLAN_COLUMNS}
            FROM plans
            WHERE id = $1
            "#
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or(BillingError::PlanNotFound(plan_id))
    }

    /// All active plans in stable (id) order.
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        if self.catalog_stale().await? {
            if let Err(e) = self.refresh_catalog().await {
                // Serve the cached rows rather than failing the listing:
                // the catalog is a cache, not an access-control authority
                tracing::warn!(error = %e, "Plan catalog refresh failed, serving cached plans");
            }
        }

        let plans: Vec<Plan> = sqlx::query_as(&format!(
            r#"
            SELECT {PLAN_COLUMNS}
            FROM plans
            WHERE is_active = TRUE
            ORDER BY id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    async fn catalog_stale(&self) -> BillingResult<bool> {
        let stale: Option<(bool,)> = sqlx::query_as(
            "SELECT TRUE FROM plans WHERE billing_model = 'metered' AND catalog_stale = TRUE LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(stale.is_some())
    }

    /// Mark cached metered plans stale. Called by the webhook processor on
    /// `product.*` / `price.*` events.
    pub async fn mark_catalog_stale(&self) -> BillingResult<()> {
        sqlx::query("UPDATE plans SET catalog_stale = TRUE WHERE billing_model = 'metered'")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pull metered plans from the Stripe product catalog and upsert them.
    /// Catalog products are matched to local rows by product id; products that
    /// disappeared from the catalog are soft-retired, never deleted.
    pub async fn refresh_catalog(&self) -> BillingResult<usize> {
        let catalog = self.gateway.list_catalog_plans().await?;

        let mut seen = Vec::with_capacity(catalog.len());
        for entry in &catalog {
            sqlx::query(
                r#"
                INSERT INTO plans (
                    name, stripe_price_id, stripe_product_id, price_cents,
                    free_quota, billing_model, is_active, catalog_stale
                ) VALUES ($1, $2, $3, $4, $5, 'metered', TRUE, FALSE)
                ON CONFLICT (stripe_product_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    stripe_price_id = EXCLUDED.stripe_price_id,
                    price_cents = EXCLUDED.price_cents,
                    free_quota = EXCLUDED.free_quota,
                    is_active = TRUE,
                    catalog_stale = FALSE,
                    updated_at = NOW()
                "#,
            )
            .bind(&entry.product_name)
            .bind(&entry.price_id)
            .bind(&entry.product_id)
            .bind(entry.unit_amount_cents)
            .bind(entry.free_quota)
            .execute(&self.pool)
            .await?;

            seen.push(entry.product_id.clone());
        }

        // Soft-retire metered plans no longer advertised
        sqlx::query(
            r#"
            UPDATE plans
            SET is_active = FALSE, catalog_stale = FALSE, updated_at = NOW()
            WHERE billing_model = 'metered'
              AND stripe_product_id IS NOT NULL
              AND stripe_product_id != ALL($1)
            "#,
        )
        .bind(&seen)
        .execute(&self.pool)
        .await?;

        tracing::info!(count = catalog.len(), "Refreshed plan catalog from Stripe");
        Ok(catalog.len())
    }

    /// Seed the default pre-paid plans if none exist yet. Idempotent: names
    /// are unique and existing rows are left untouched.
    pub async fn seed_default_plans(&self) -> BillingResult<()> {
        let defaults: [(&str, i64, i32); 4] = [
            ("Free", 0, 20),
            ("Basic", 999, 150),
            ("Professional", 2999, 500),
            ("Enterprise", 9999, 2000),
        ];

        for (name, price_cents, free_quota) in defaults {
            sqlx::query(
                r#"
                INSERT INTO plans (name, price_cents, free_quota, billing_model, is_active)
                VALUES ($1, $2, $3, 'pre_paid', TRUE)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(name)
            .bind(price_cents)
            .bind(free_quota)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!("Ensured default subscription plans exist");
        Ok(())
    }
}
