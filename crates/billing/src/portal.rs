//! Stripe billing portal sessions

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::profiles::ProfileStore;
use crate::provider::PaymentProvider;

#[derive(Debug, Clone, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub struct PortalService {
    provider: Arc<dyn PaymentProvider>,
    profiles: Arc<dyn ProfileStore>,
    return_url: String,
}

impl PortalService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        profiles: Arc<dyn ProfileStore>,
        frontend_url: &str,
    ) -> Self {
        Self {
            provider,
            profiles,
            return_url: format!("{}/plans", frontend_url.trim_end_matches('/')),
        }
    }

    /// Portal link for a user who has subscribed at least once
    pub async fn create_portal_session(&self, user_id: &str) -> BillingResult<PortalResponse> {
        let customer_id = self
            .profiles
            .find_by_user_id(user_id)
            .await?
            .and_then(|p| p.provider_customer_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("No billing account for user {}", user_id))
            })?;

        let url = self
            .provider
            .create_portal_session(&customer_id, &self.return_url)
            .await?;

        tracing::info!(user_id = %user_id, customer_id = %customer_id, "Created portal session");
        Ok(PortalResponse { url })
    }
}
