//! Deferred usage report processor
//!
//! Drains the pending_usage_reports queue: usage records that failed inline
//! delivery to Stripe are retried here with bounded attempts. Rows are
//! claimed with FOR UPDATE SKIP LOCKED so multiple workers never double-send.
//! Delivery is idempotent at Stripe via the stored idempotency key, so a
//! crash between send and status update cannot double-bill.

use docuport_billing::BillingGateway;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Process pending usage reports from the queue
pub async fn process_report_queue(pool: &PgPool, gateway: &BillingGateway) {
    // Claim reports to process (pending or failed with retries remaining)
    let reports: Vec<(Uuid, Uuid, String, i64, Uuid, i32, i32)> = match sqlx::query_as(
        r#"
        SELECT id, subscription_id, stripe_item_id, quantity, idempotency_key,
               attempts, max_attempts
        FROM pending_usage_reports
        WHERE (status = 'pending' OR (status = 'failed' AND attempts < max_attempts))
          AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - INTERVAL '5 minutes')
        ORDER BY created_at ASC
        LIMIT 10
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to fetch pending usage reports");
            return;
        }
    };

    if reports.is_empty() {
        return; // No work to do
    }

    info!(count = reports.len(), "Processing deferred usage reports");

    for (report_id, subscription_id, item_id, quantity, idempotency_key, attempts, max_attempts) in
        reports
    {
        // Mark as processing
        if let Err(e) = sqlx::query(
            r#"
            UPDATE pending_usage_reports
            SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(report_id)
        .execute(pool)
        .await
        {
            error!(report_id = %report_id, error = %e, "Failed to mark report as processing");
            continue;
        }

        let quantity_units = quantity.max(0) as u64;
        let result = gateway
            .report_usage(&item_id, quantity_units, &idempotency_key.to_string())
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = sqlx::query(
                    "UPDATE pending_usage_reports SET status = 'completed', processed_at = NOW() WHERE id = $1",
                )
                .bind(report_id)
                .execute(pool)
                .await
                {
                    error!(report_id = %report_id, error = %e, "Failed to mark report as completed");
                }

                // Keep the audit trail consistent with inline delivery
                if let Err(e) = sqlx::query(
                    r#"
                    INSERT INTO usage_reports (
                        id, subscription_id, stripe_item_id, quantity, idempotency_key
                    ) VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (idempotency_key) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(subscription_id)
                .bind(&item_id)
                .bind(quantity)
                .bind(idempotency_key)
                .execute(pool)
                .await
                {
                    warn!(report_id = %report_id, error = %e, "Failed to store usage report audit record");
                }

                info!(
                    report_id = %report_id,
                    subscription_id = %subscription_id,
                    quantity = quantity,
                    "Deferred usage report delivered"
                );
            }
            Err(e) => {
                let error_msg = e.to_string();
                let new_attempts = attempts + 1;

                if new_attempts >= max_attempts {
                    // Terminal: stamp processed_at so retention cleanup can
                    // eventually delete the row
                    if let Err(e) = sqlx::query(
                        "UPDATE pending_usage_reports SET status = 'failed', last_error = $1, processed_at = NOW() WHERE id = $2",
                    )
                    .bind(&error_msg)
                    .bind(report_id)
                    .execute(pool)
                    .await
                    {
                        error!(report_id = %report_id, error = %e, "Failed to mark report as failed");
                    }

                    error!(
                        report_id = %report_id,
                        subscription_id = %subscription_id,
                        attempts = new_attempts,
                        error = %error_msg,
                        "Usage report permanently failed after max retries"
                    );
                } else {
                    if let Err(e) = sqlx::query(
                        "UPDATE pending_usage_reports SET status = 'failed', last_error = $1 WHERE id = $2",
                    )
                    .bind(&error_msg)
                    .bind(report_id)
                    .execute(pool)
                    .await
                    {
                        error!(report_id = %report_id, error = %e, "Failed to mark report as failed");
                    }

                    warn!(
                        report_id = %report_id,
                        attempts = new_attempts,
                        max_attempts = max_attempts,
                        error = %error_msg,
                        "Usage report delivery failed, will retry"
                    );
                }
            }
        }
    }
}

/// Cleanup old completed/failed reports (for maintenance job)
pub async fn cleanup_old_reports(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM pending_usage_reports
        WHERE processed_at < NOW() - ($1 || ' days')::INTERVAL
          AND status IN ('completed', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old usage report queue entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup old usage reports");
        }
    }
}
