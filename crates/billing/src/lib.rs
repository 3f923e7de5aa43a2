// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sprouttie Billing Module
//!
//! Keeps each user's plan consistent with Stripe's webhook stream.
//!
//! ## Pipeline
//!
//! - **Signature verification**: HMAC-SHA256 over the raw body, checked before parsing
//! - **Idempotency**: every event ID is claimed once in a durable ledger
//! - **Identity resolution**: metadata, client reference, customer ID, then email
//! - **Plan mapping**: configured price IDs to plan tiers
//! - **Reconciliation**: ordered writes to the user's profile
//! - **Notification**: best-effort plan activation email
//!
//! Checkout and billing portal sessions are created here as well.

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod identity;
pub mod idempotency;
pub mod plans;
pub mod portal;
pub mod profiles;
pub mod provider;
pub mod reconcile;
pub mod signature;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod testing;

// Re-export checkout types
pub use checkout::{CheckoutResponse, CheckoutService};

// Re-export client types
pub use client::{PriceIds, StripeClient, StripeConfig};

// Re-export email types
pub use email::{
    BillingEmailService, EmailConfig, EmailMessage, EmailSender, NotificationError,
    PlanActivationNotifier,
};

// Re-export error types
pub use error::{BillingError, BillingResult};

// Re-export event types
pub use events::{EventKind, ProviderEvent};

// Re-export identity types
pub use identity::{IdentityResolver, IdentitySource, IdentityUnresolved, UserIdentity};

// Re-export ledger types
pub use idempotency::{
    ClaimOutcome, EventLedger, InMemoryEventLedger, PgEventLedger, ProcessedEventRecord,
    ProcessingStatus,
};

// Re-export plan types
pub use plans::{BillingCycle, PlanTier, PriceCatalog, UnknownPriceError};

// Re-export portal types
pub use portal::{PortalResponse, PortalService};

// Re-export profile types
pub use profiles::{InMemoryProfileStore, PgProfileStore, ProfileStore, UserProfile};

// Re-export provider types
pub use provider::PaymentProvider;

// Re-export reconciliation types
pub use reconcile::{ReconciliationOutcome, StateReconciler};

// Re-export signature types
pub use signature::{SignatureError, WebhookVerifier};

// Re-export webhook types
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Store and external-service handles the billing services share
#[derive(Clone)]
pub struct BillingDeps {
    pub ledger: Arc<dyn EventLedger>,
    pub profiles: Arc<dyn ProfileStore>,
    pub provider: Arc<dyn PaymentProvider>,
    pub email: Arc<dyn EmailSender>,
}

impl BillingDeps {
    /// Postgres-backed stores
    pub fn postgres(pool: PgPool, stripe: StripeClient, email: BillingEmailService) -> Self {
        Self {
            ledger: Arc::new(PgEventLedger::new(pool.clone())),
            profiles: Arc::new(PgProfileStore::new(pool)),
            provider: Arc::new(stripe),
            email: Arc::new(email),
        }
    }

    /// Process-local stores; state is lost on restart
    pub fn in_memory(provider: Arc<dyn PaymentProvider>, email: Arc<dyn EmailSender>) -> Self {
        Self {
            ledger: Arc::new(InMemoryEventLedger::new()),
            profiles: Arc::new(InMemoryProfileStore::new()),
            provider,
            email,
        }
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: Arc<PriceCatalog>,
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    pub fn new(
        config: &StripeConfig,
        frontend_url: &str,
        notify_timeout: Duration,
        deps: BillingDeps,
    ) -> Self {
        let catalog = Arc::new(PriceCatalog::from_price_ids(&config.price_ids));
        if catalog.is_empty() {
            tracing::warn!("No Stripe price IDs configured, every price will be unknown");
        }

        let verifier = WebhookVerifier::new(
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );
        let notifier = PlanActivationNotifier::new(deps.email.clone(), notify_timeout);

        Self {
            checkout: CheckoutService::new(
                deps.provider.clone(),
                deps.profiles.clone(),
                catalog.clone(),
                frontend_url,
            ),
            portal: PortalService::new(deps.provider.clone(), deps.profiles.clone(), frontend_url),
            webhooks: WebhookHandler::new(
                verifier,
                deps.ledger,
                deps.profiles,
                catalog.clone(),
                deps.provider,
                notifier,
            ),
            catalog,
        }
    }
}
