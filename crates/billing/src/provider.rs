//! Payment provider port
//!
//! The calls the billing core makes out to the payment provider. The Stripe
//! implementation lives in [`crate::client`]; tests substitute fakes.

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::plans::{BillingCycle, PlanTier};

/// The parts of a live subscription the reconciler needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub status: String,
    /// Unix timestamp
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

/// Parameters for a hosted subscription checkout
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub price_id: String,
    pub plan: PlanTier,
    pub cycle: BillingCycle,
    pub user_id: String,
    pub email: Option<String>,
    /// Reuse an existing customer instead of letting Stripe create one
    pub customer_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Fetch a subscription's current price, status and period
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    /// Create a checkout session and return its redirect URL
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest)
        -> BillingResult<String>;

    /// Create a billing portal session and return its redirect URL
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
        -> BillingResult<String>;
}
