//! Shared application state

use sqlx::PgPool;

use docuport_billing::{
    AuthorizationService, BillingGateway, PlanService, QuotaLedger, StripeClient,
    SubscriptionService, UsageService, WebhookProcessor,
};

use crate::config::Config;
use crate::error::ApiError;

/// Billing service handles, wired once at startup
#[derive(Clone)]
pub struct BillingServices {
    pub plans: PlanService,
    pub subscriptions: SubscriptionService,
    pub quota: QuotaLedger,
    pub authorization: AuthorizationService,
    pub usage: UsageService,
    pub webhooks: WebhookProcessor,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: BillingServices,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Result<Self, ApiError> {
        let stripe = StripeClient::from_env().map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize Stripe client");
            ApiError::Internal
        })?;
        let stripe_config = stripe.config().clone();
        let gateway = BillingGateway::new(stripe);

        let quota = QuotaLedger::new(pool.clone(), stripe_config.max_carryover);
        let plans = PlanService::new(pool.clone(), gateway.clone());
        let subscriptions = SubscriptionService::new(pool.clone(), gateway.clone(), plans.clone());
        let authorization = AuthorizationService::new(
            pool.clone(),
            quota.clone(),
            subscriptions.clone(),
            plans.clone(),
            gateway.clone(),
            stripe_config.usage_report_attempts,
        );
        let usage = UsageService::new(
            pool.clone(),
            subscriptions.clone(),
            plans.clone(),
            quota.clone(),
        );
        let webhooks = WebhookProcessor::new(
            pool.clone(),
            plans.clone(),
            subscriptions.clone(),
            quota.clone(),
            stripe_config.webhook_secret,
        );

        Ok(Self {
            pool,
            config,
            billing: BillingServices {
                plans,
                subscriptions,
                quota,
                authorization,
                usage,
                webhooks,
            },
        })
    }
}
