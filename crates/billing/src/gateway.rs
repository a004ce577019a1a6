//! Billing gateway adapter
//!
//! Thin wrapper over the Stripe API: customer and subscription lifecycle,
//! metered usage reporting, and product catalog retrieval. Everything the rest
//! of the engine knows about Stripe goes through this module so it can be
//! swapped out in tests.

use std::collections::HashMap;

use stripe::{
    CreateCustomer, CreateSubscription, CreateSubscriptionItems, CreateUsageRecord, Customer,
    CustomerId, Expandable, Invoice, ListCustomers, ListInvoices, ListPrices, Price, Subscription,
    SubscriptionId, SubscriptionItemId, UpdateSubscription, UsageRecord, UsageRecordAction,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// A subscription plan as advertised in the Stripe product catalog.
/// Only products tagged with `is_subscription_plan=true` metadata qualify.
#[derive(Debug, Clone)]
pub struct CatalogPlan {
    pub product_id: String,
    pub product_name: String,
    pub price_id: String,
    pub unit_amount_cents: i64,
    pub free_quota: i32,
    pub description: Option<String>,
}

/// An invoice as billed by Stripe. Amounts are minor units (cents).
#[derive(Debug, Clone)]
pub struct GatewayInvoice {
    pub invoice_id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub created: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

/// Result of creating a subscription at the gateway
#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub subscription_id: String,
    pub customer_id: String,
    /// The single subscription item, used for metered usage reporting
    pub item_id: Option<String>,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
}

/// Gateway adapter for all outbound Stripe calls
#[derive(Clone)]
pub struct BillingGateway {
    stripe: StripeClient,
}

impl BillingGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Find an existing customer by email or create one, tagging it with
    /// user/org metadata so webhook events can be routed back to the owner.
    pub async fn find_or_create_customer(
        &self,
        user_id: &str,
        org_id: &str,
        email: &str,
    ) -> BillingResult<Customer> {
        let mut list = ListCustomers::new();
        list.email = Some(email);
        list.limit = Some(1);

        let existing = Customer::list(self.stripe.inner(), &list).await?;
        if let Some(customer) = existing.data.into_iter().next() {
            return Ok(customer);
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("platform".to_string(), "docuport".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            org_id = %org_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer)
    }

    /// Create a subscription for a customer on the given price.
    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        user_id: &str,
        org_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("org_id".to_string(), org_id.to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Created Stripe subscription"
        );

        Ok(Self::into_gateway_subscription(subscription))
    }

    /// Schedule cancellation at the end of the current billing period.
    /// The definitive `customer.subscription.deleted` event arrives later
    /// through the webhook processor.
    pub async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        let subscription_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let mut update = UpdateSubscription::new();
        update.cancel_at_period_end = Some(true);

        Subscription::update(self.stripe.inner(), &subscription_id, update).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            "Scheduled subscription cancellation at period end"
        );

        Ok(())
    }

    /// Report metered usage for a subscription item.
    ///
    /// The idempotency key is attached at the HTTP layer so a retried report
    /// is applied at most once by Stripe.
    pub async fn report_usage(
        &self,
        item_id: &str,
        quantity: u64,
        idempotency_key: &str,
    ) -> BillingResult<()> {
        let item_id = item_id
            .parse::<SubscriptionItemId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription item ID: {}", e)))?;

        let params = CreateUsageRecord {
            quantity,
            action: Some(UsageRecordAction::Increment),
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        };

        let client = self.stripe.inner_idempotent(idempotency_key);
        UsageRecord::create(&client, &item_id, params).await?;

        tracing::info!(
            item_id = %item_id,
            quantity = quantity,
            "Reported usage to Stripe"
        );

        Ok(())
    }

    /// List a customer's invoices, most recent first.
    pub async fn list_invoices(
        &self,
        customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<GatewayInvoice>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut params = ListInvoices::new();
        params.customer = Some(customer_id);
        params.limit = Some(limit);

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;

        Ok(invoices
            .data
            .into_iter()
            .map(|invoice| GatewayInvoice {
                invoice_id: invoice.id.to_string(),
                number: invoice.number,
                status: invoice.status.map(|s| s.to_string()),
                amount_due_cents: invoice.amount_due.unwrap_or(0),
                amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string()),
                created: invoice
                    .created
                    .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                hosted_invoice_url: invoice.hosted_invoice_url,
                invoice_pdf: invoice.invoice_pdf,
            })
            .collect())
    }

    /// List the subscription plans advertised in the Stripe product catalog.
    pub async fn list_catalog_plans(&self) -> BillingResult<Vec<CatalogPlan>> {
        let mut params = ListPrices::new();
        params.active = Some(true);
        params.limit = Some(100);
        params.expand = &["data.product"];

        let prices = Price::list(self.stripe.inner(), &params).await?;

        let mut plans = Vec::new();
        for price in prices.data {
            let product = match &price.product {
                Some(Expandable::Object(product)) => product,
                _ => continue,
            };

            let is_plan = product
                .metadata
                .as_ref()
                .and_then(|m| m.get("is_subscription_plan"))
                .map(|v| v == "true")
                .unwrap_or(false);
            if !is_plan {
                continue;
            }

            let free_quota = product
                .metadata
                .as_ref()
                .and_then(|m| m.get("free_quota"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            plans.push(CatalogPlan {
                product_id: product.id.to_string(),
                product_name: product.name.clone().unwrap_or_default(),
                price_id: price.id.to_string(),
                unit_amount_cents: price.unit_amount.unwrap_or(0),
                free_quota,
                description: product.description.clone(),
            });
        }

        Ok(plans)
    }

    fn into_gateway_subscription(subscription: Subscription) -> GatewaySubscription {
        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.to_string());

        GatewaySubscription {
            subscription_id: subscription.id.to_string(),
            customer_id: subscription.customer.id().to_string(),
            item_id,
            status: subscription.status.to_string(),
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        }
    }
}
