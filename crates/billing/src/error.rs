//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Billing gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(i32),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User {0} already has an active subscription")]
    AlreadySubscribed(String),

    #[error("Subscription is cancelled and cannot be modified")]
    SubscriptionCancelled,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        // Connection-level failures are transient and retried by callers;
        // everything else is a hard API error.
        match &err {
            stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout => {
                BillingError::GatewayUnavailable(err.to_string())
            }
            _ => BillingError::StripeApi(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
