//! Hosted checkout session creation
//!
//! The session carries our user ID three ways (client reference, session
//! metadata, subscription metadata) so the webhook side can resolve the user
//! without relying on email.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingCycle, PlanTier, PriceCatalog};
use crate::profiles::ProfileStore;
use crate::provider::{CheckoutSessionRequest, PaymentProvider};

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub struct CheckoutService {
    provider: Arc<dyn PaymentProvider>,
    profiles: Arc<dyn ProfileStore>,
    catalog: Arc<PriceCatalog>,
    frontend_url: String,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        profiles: Arc<dyn ProfileStore>,
        catalog: Arc<PriceCatalog>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            profiles,
            catalog,
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a subscription checkout for `plan` and return its redirect URL
    pub async fn create_checkout_session(
        &self,
        plan: &str,
        cycle: BillingCycle,
        user_id: &str,
        email: Option<&str>,
    ) -> BillingResult<CheckoutResponse> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(BillingError::InvalidInput("userId is required".into()));
        }

        let tier: PlanTier = plan
            .parse()
            .map_err(|_| BillingError::InvalidPlan(plan.to_string()))?;
        let price_id = self
            .catalog
            .price_for(tier, cycle)
            .ok_or_else(|| {
                tracing::warn!(
                    plan = %tier,
                    billing_cycle = cycle.as_str(),
                    "No price configured for requested plan"
                );
                BillingError::InvalidPlan(plan.to_string())
            })?
            .to_string();

        // Returning customers keep their Stripe customer
        let customer_id = self
            .profiles
            .find_by_user_id(user_id)
            .await?
            .and_then(|p| p.provider_customer_id);

        let email = email.map(str::trim).filter(|e| !e.is_empty());

        let request = CheckoutSessionRequest {
            price_id,
            plan: tier,
            cycle,
            user_id: user_id.to_string(),
            email: email.map(str::to_string),
            customer_id,
            success_url: format!("{}/pdf-success", self.frontend_url),
            cancel_url: format!("{}/plans", self.frontend_url),
        };

        tracing::info!(
            user_id = %user_id,
            plan = %tier,
            billing_cycle = cycle.as_str(),
            existing_customer = request.customer_id.is_some(),
            "Creating checkout session"
        );

        let url = self.provider.create_checkout_session(&request).await?;
        Ok(CheckoutResponse { url })
    }
}
