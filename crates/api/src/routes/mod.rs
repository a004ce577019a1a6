//! API routes

pub mod billing;
pub mod health;
pub mod webhooks;

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState};

/// Caller identity, asserted by the upstream auth proxy via headers.
/// Authentication itself happens before requests reach this service.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub org_id: String,
    pub email: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let user_id = header("x-user-id").ok_or(ApiError::Unauthorized)?;
        let org_id = header("x-org-id").ok_or(ApiError::Unauthorized)?;

        Ok(Self {
            user_id,
            org_id,
            email: header("x-user-email"),
        })
    }
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Stripe webhook (public, uses signature verification)
    let webhook_routes = Router::new().route("/webhooks/stripe", post(webhooks::stripe_webhook));

    // Billing routes - under /api/v1
    let billing_routes = Router::new()
        .route("/billing/plans", get(billing::list_plans))
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/usage", get(billing::get_usage))
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/cancel", post(billing::cancel_subscription));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", billing_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
