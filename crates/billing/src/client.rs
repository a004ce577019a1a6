//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Cap applied to unused quota carried into the next period (pre-paid plans)
    pub max_carryover: i32,
    /// How many times a failed usage report is retried inline before being
    /// queued for the worker
    pub usage_report_attempts: usize,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            max_carryover: std::env::var("QUOTA_MAX_CARRYOVER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_CARRYOVER),
            usage_report_attempts: std::env::var("USAGE_REPORT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        })
    }
}

/// Unused quota carries a single hop into the next period, capped so that a
/// dormant account cannot bank an unbounded allowance.
pub const DEFAULT_MAX_CARRYOVER: i32 = 500;

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get an inner client that sends the given idempotency key with requests.
    /// Used for usage reporting so a retried report is applied at most once.
    pub fn inner_idempotent(&self, key: &str) -> Client {
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
