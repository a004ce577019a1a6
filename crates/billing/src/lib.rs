//! Billing engine: subscriptions, quota accounting, and Stripe integration
//!
//! Gates metered operations (document uploads and OCR runs) behind an
//! organization's subscription. Pre-paid plans consume a monthly quota with
//! carryover; metered plans report usage to Stripe for end-of-period
//! invoicing. All volume accounting is local and transactional; Stripe is
//! the source of truth for payment state only.

pub mod authorize;
pub mod client;
pub mod error;
pub mod gateway;
pub mod plans;
pub mod quota;
pub mod subscription;
pub mod usage;
pub mod webhook;

pub use authorize::{AuthDecision, AuthorizationService, DenyReason, UsageAuthorization};
pub use client::{StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use gateway::{BillingGateway, CatalogPlan, GatewayInvoice, GatewaySubscription};
pub use plans::{Plan, PlanService};
pub use quota::{QuotaCheck, QuotaLedger, UsageQuota};
pub use subscription::{SubscriptionRecord, SubscriptionService};
pub use usage::{UsageService, UsageSummary};
pub use webhook::{WebhookDisposition, WebhookProcessor};
