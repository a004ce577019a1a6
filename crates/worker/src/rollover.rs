//! Billing period rollover
//!
//! Advances lapsed pre-paid subscriptions to their next calendar period and
//! creates the next quota row with carryover. Quota rows are also created
//! lazily on first use, so this job only front-runs that path; missing a run
//! changes nothing about the accounting.

use docuport_billing::{PlanService, QuotaLedger, SubscriptionService};
use tracing::{error, info};

/// Roll over all active pre-paid subscriptions whose period has ended
pub async fn roll_over_lapsed_periods(
    subscriptions: &SubscriptionService,
    plans: &PlanService,
    quota: &QuotaLedger,
) {
    let due = match subscriptions.due_for_rollover().await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to list subscriptions due for rollover");
            return;
        }
    };

    if due.is_empty() {
        return;
    }

    info!(count = due.len(), "Rolling over lapsed billing periods");

    for subscription in due {
        let plan = match plans.get_plan(subscription.plan_id).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(
                    subscription_id = %subscription.id,
                    plan_id = subscription.plan_id,
                    error = %e,
                    "Failed to load plan for rollover"
                );
                continue;
            }
        };

        if let Err(e) = subscriptions.renew_period(&subscription).await {
            error!(
                subscription_id = %subscription.id,
                error = %e,
                "Failed to renew subscription period"
            );
            continue;
        }

        match quota.roll_over(&subscription, plan.free_quota).await {
            Ok(next) => {
                info!(
                    subscription_id = %subscription.id,
                    quota_limit = next.quota_limit,
                    carryover = next.carryover_from_previous,
                    "Created next quota period"
                );
            }
            Err(e) => {
                error!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to create next quota period"
                );
            }
        }
    }
}
