//! Quota ledger for pre-paid plans
//!
//! Tracks consumption per (subscription, billing period): limit, used,
//! remaining, carryover. The ledger is the access-control authority for
//! pre-paid plans, so its arithmetic must hold under concurrent uploads:
//! `authorize` is a pure check and `commit` re-reads the period row under a
//! row lock in the same transaction.

use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscription::SubscriptionRecord;

/// One billing period's quota for a subscription.
/// Invariant: `quota_remaining = quota_limit - quota_used` at all times;
/// `quota_limit = plan free quota + carryover_from_previous + one-time credits`.
#[derive(Debug, Clone)]
pub struct UsageQuota {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: String,
    pub org_id: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub quota_limit: i32,
    pub quota_used: i32,
    pub quota_remaining: i32,
    pub carryover_from_previous: i32,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for UsageQuota {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            user_id: row.try_get("user_id")?,
            org_id: row.try_get("org_id")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            quota_limit: row.try_get("quota_limit")?,
            quota_used: row.try_get("quota_used")?,
            quota_remaining: row.try_get("quota_remaining")?,
            carryover_from_previous: row.try_get("carryover_from_previous")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Outcome of a pure quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCheck {
    Ok,
    Insufficient { remaining: i32, needed: i32 },
}

const QUOTA_COLUMNS: &str = r#"
    id, subscription_id, user_id, org_id, period_start, period_end,
    quota_limit, quota_used, quota_remaining, carryover_from_previous, created_at
"#;

/// Quota ledger service
#[derive(Clone)]
pub struct QuotaLedger {
    pool: PgPool,
    max_carryover: i32,
}

impl QuotaLedger {
    pub fn new(pool: PgPool, max_carryover: i32) -> Self {
        Self {
            pool,
            max_carryover,
        }
    }

    /// Get the quota row covering "now" for a subscription, creating it lazily
    /// at the start of a new billing period. Creation carries forward unused
    /// quota from the immediately preceding period only, capped at
    /// `max_carryover`.
    pub async fn current_period(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
    ) -> BillingResult<UsageQuota> {
        let now = OffsetDateTime::now_utc();

        if let Some(quota) = self.find_period(subscription.id, now).await? {
            return Ok(quota);
        }

        self.create_period(subscription, plan_free_quota, now).await
    }

    async fn find_period(
        &self,
        subscription_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<UsageQuota>> {
        let quota: Option<UsageQuota> = sqlx::query_as(&format!(
            r#"
            SELECT {QUOTA_COLUMNS}
            FROM usage_quotas
            WHERE subscription_id = $1
              AND period_start <= $2
              AND period_end > $2
            "#
        ))
        .bind(subscription_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(quota)
    }

    /// Create the quota row for the period containing `at`. Safe under
    /// concurrent callers: the unique index on (subscription_id, period_start)
    /// makes the insert a no-op for the loser, which then re-reads.
    async fn create_period(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
        at: OffsetDateTime,
    ) -> BillingResult<UsageQuota> {
        let (period_start, period_end) = period_window(subscription.current_period_start, at);

        // Single-hop carryover: only the immediately preceding period counts
        let previous: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT quota_remaining
            FROM usage_quotas
            WHERE subscription_id = $1
              AND period_end = $2
            "#,
        )
        .bind(subscription.id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        let carryover = previous
            .map(|(remaining,)| remaining.min(self.max_carryover))
            .unwrap_or(0)
            .max(0);
        let quota_limit = plan_free_quota + carryover;

        let inserted = sqlx::query(
            r#"
            INSERT INTO usage_quotas (
                id, subscription_id, user_id, org_id, period_start, period_end,
                quota_limit, quota_used, quota_remaining, carryover_from_previous
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $7, $8)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.org_id)
        .bind(period_start)
        .bind(period_end)
        .bind(quota_limit)
        .bind(carryover)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(
                subscription_id = %subscription.id,
                period_start = %period_start,
                quota_limit = quota_limit,
                carryover = carryover,
                "Created usage quota for new billing period"
            );
        }

        // Re-read regardless of who won the insert race
        self.find_period(subscription.id, at)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Quota period missing after insert for subscription {}",
                    subscription.id
                ))
            })
    }

    /// Pure check: does the current period have at least `amount` remaining?
    /// Never mutates state; mutation happens only in `commit` after the
    /// operation succeeded, so failed uploads are never charged.
    pub async fn authorize(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
        amount: i32,
    ) -> BillingResult<QuotaCheck> {
        let quota = self.current_period(subscription, plan_free_quota).await?;

        if quota.quota_remaining >= amount {
            Ok(QuotaCheck::Ok)
        } else {
            Ok(QuotaCheck::Insufficient {
                remaining: quota.quota_remaining,
                needed: amount,
            })
        }
    }

    /// Atomically consume `amount` from the current period.
    ///
    /// Re-reads the period row `FOR UPDATE` inside the transaction, so two
    /// concurrent authorize+commit pairs that both passed the pure check
    /// serialize here and the second fails instead of driving the counter
    /// negative. Re-reading inside the transaction also resolves the race with
    /// period rollover: the commit lands in whichever period row is current.
    pub async fn commit(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
        amount: i32,
    ) -> BillingResult<QuotaCheck> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Commit amount must be positive, got {}",
                amount
            )));
        }

        // Ensure the period row exists before locking it
        self.current_period(subscription, plan_free_quota).await?;

        let mut tx = self.pool.begin().await?;

        let quota = self
            .lock_current_period(&mut tx, subscription.id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "No current quota period for subscription {}",
                    subscription.id
                ))
            })?;

        if quota.quota_remaining < amount {
            tx.rollback().await.ok();
            return Ok(QuotaCheck::Insufficient {
                remaining: quota.quota_remaining,
                needed: amount,
            });
        }

        sqlx::query(
            r#"
            UPDATE usage_quotas
            SET quota_used = quota_used + $1,
                quota_remaining = quota_limit - (quota_used + $1),
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(amount)
        .bind(quota.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            amount = amount,
            remaining = quota.quota_remaining - amount,
            "Committed quota usage"
        );

        Ok(QuotaCheck::Ok)
    }

    async fn lock_current_period(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
    ) -> BillingResult<Option<UsageQuota>> {
        let quota: Option<UsageQuota> = sqlx::query_as(&format!(
            r#"
            SELECT {QUOTA_COLUMNS}
            FROM usage_quotas
            WHERE subscription_id = $1
              AND period_start <= NOW()
              AND period_end > NOW()
            FOR UPDATE
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(quota)
    }

    /// Credit purchased quota to the current period. Idempotent per payment
    /// intent: replaying the same intent id inserts nothing and credits
    /// nothing.
    pub async fn add_one_time_quota(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
        quota_purchased: i32,
        amount_cents: i64,
        payment_intent_id: &str,
        description: Option<&str>,
    ) -> BillingResult<bool> {
        if quota_purchased <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Purchased quota must be positive, got {}",
                quota_purchased
            )));
        }

        // Ensure the period row exists before locking it
        self.current_period(subscription, plan_free_quota).await?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO one_time_payments (
                id, user_id, org_id, stripe_payment_intent_id,
                amount_cents, quota_purchased, description
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&subscription.user_id)
        .bind(&subscription.org_id)
        .bind(payment_intent_id)
        .bind(amount_cents)
        .bind(quota_purchased)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Replayed payment intent: already credited
            tx.rollback().await.ok();
            tracing::info!(
                payment_intent_id = %payment_intent_id,
                "Skipping already-credited one-time payment"
            );
            return Ok(false);
        }

        let quota = self
            .lock_current_period(&mut tx, subscription.id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "No current quota period for subscription {}",
                    subscription.id
                ))
            })?;

        sqlx::query(
            r#"
            UPDATE usage_quotas
            SET quota_limit = quota_limit + $1,
                quota_remaining = quota_remaining + $1,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(quota_purchased)
        .bind(quota.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            payment_intent_id = %payment_intent_id,
            quota_purchased = quota_purchased,
            "Credited one-time quota purchase"
        );

        Ok(true)
    }

    /// Create the next period row for a subscription whose period just ended,
    /// carrying forward the remaining balance. Used by the worker rollover job.
    pub async fn roll_over(
        &self,
        subscription: &SubscriptionRecord,
        plan_free_quota: i32,
    ) -> BillingResult<UsageQuota> {
        let now = OffsetDateTime::now_utc();
        self.create_period(subscription, plan_free_quota, now).await
    }
}

/// Compute the calendar-month billing window containing `at`, aligned to the
/// subscription's anchor date. Anchor days past the end of a month clamp to
/// that month's last day (an anchor of Jan 31 yields Feb 28 / Mar 31 / ...).
pub fn period_window(anchor: OffsetDateTime, at: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let mut months_since = (at.year() - anchor.year()) * 12
        + (u8::from(at.month()) as i32 - u8::from(anchor.month()) as i32);

    if shift_months(anchor, months_since) > at {
        months_since -= 1;
    }

    // Both bounds derive from the anchor, not from each other, so a clamped
    // start (Feb 28) does not shorten every following month to the 28th
    let start = shift_months(anchor, months_since);
    let end = shift_months(anchor, months_since + 1);

    (start, end)
}

fn shift_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = (from.year() * 12 + u8::from(from.month()) as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    let month = Month::try_from(month_index).unwrap_or(Month::January);

    let day = from
        .day()
        .min(time::util::days_in_year_month(year, month));

    let date = Date::from_calendar_date(year, month, day).unwrap_or(from.date());
    PrimitiveDateTime::new(date, from.time()).assume_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_period_window_mid_month_anchor() {
        let anchor = datetime!(2024-01-15 09:30:00 UTC);

        let (start, end) = period_window(anchor, datetime!(2024-03-20 00:00:00 UTC));
        assert_eq!(start, datetime!(2024-03-15 09:30:00 UTC));
        assert_eq!(end, datetime!(2024-04-15 09:30:00 UTC));

        // Just before the anchor day falls in the previous window
        let (start, end) = period_window(anchor, datetime!(2024-03-10 00:00:00 UTC));
        assert_eq!(start, datetime!(2024-02-15 09:30:00 UTC));
        assert_eq!(end, datetime!(2024-03-15 09:30:00 UTC));
    }

    #[test]
    fn test_period_window_contains_at() {
        let anchor = datetime!(2023-06-01 00:00:00 UTC);
        let at = datetime!(2024-02-29 12:00:00 UTC);
        let (start, end) = period_window(anchor, at);
        assert!(start <= at && at < end);
    }

    #[test]
    fn test_period_window_end_of_month_anchor_clamps() {
        let anchor = datetime!(2024-01-31 00:00:00 UTC);

        // February clamps to the 29th (2024 is a leap year)
        let (start, end) = period_window(anchor, datetime!(2024-02-29 12:00:00 UTC));
        assert_eq!(start, datetime!(2024-02-29 00:00:00 UTC));
        assert_eq!(end, datetime!(2024-03-31 00:00:00 UTC));
    }

    #[test]
    fn test_period_window_anchor_month() {
        let anchor = datetime!(2024-05-10 00:00:00 UTC);
        let (start, end) = period_window(anchor, datetime!(2024-05-10 00:00:00 UTC));
        assert_eq!(start, anchor);
        assert_eq!(end, datetime!(2024-06-10 00:00:00 UTC));
    }

    #[test]
    fn test_shift_months_across_year_boundary() {
        let from = datetime!(2023-11-30 08:00:00 UTC);
        assert_eq!(shift_months(from, 3), datetime!(2024-02-29 08:00:00 UTC));
        assert_eq!(shift_months(from, -11), datetime!(2022-12-30 08:00:00 UTC));
    }
}
