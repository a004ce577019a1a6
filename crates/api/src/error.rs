//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use docuport_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Identity errors
    #[error("Caller identity required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("Subscription required")]
    SubscriptionRequired,
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Subscription is cancelled")]
    SubscriptionCancelled,
    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            ApiError::SubscriptionRequired => (
                StatusCode::PAYMENT_REQUIRED,
                "SUBSCRIPTION_REQUIRED",
                self.to_string(),
            ),
            ApiError::QuotaExceeded(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "QUOTA_EXCEEDED", msg.clone())
            }
            ApiError::SubscriptionCancelled => (
                StatusCode::CONFLICT,
                "SUBSCRIPTION_CANCELLED",
                self.to_string(),
            ),
            ApiError::InvalidWebhookSignature => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                self.to_string(),
            ),

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::PlanNotFound(_) => ApiError::NotFound,
            BillingError::SubscriptionNotFound(_) | BillingError::CustomerNotFound(_) => {
                ApiError::NotFound
            }
            BillingError::AlreadySubscribed(msg) => ApiError::Conflict(msg),
            BillingError::SubscriptionCancelled => ApiError::SubscriptionCancelled,
            BillingError::WebhookSignatureInvalid => ApiError::InvalidWebhookSignature,
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::GatewayUnavailable(msg) => {
                tracing::error!(error = %msg, "Billing gateway unavailable");
                ApiError::ServiceUnavailable
            }
            BillingError::StripeApi(msg) => {
                tracing::error!(error = %msg, "Stripe API error");
                ApiError::Internal
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) => {
                tracing::error!(error = %msg, "Billing configuration error");
                ApiError::Internal
            }
            BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
