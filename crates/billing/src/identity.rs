//! Event to user resolution
//!
//! Stripe objects do not always carry our user ID. Resolution walks an
//! ordered fallback chain and the first hit wins:
//!
//! 1. `metadata.user_id` on the event object
//! 2. `client_reference_id` set when the checkout session was created
//! 3. an existing profile linked to the event's customer ID
//! 4. an existing profile with the event's email, which is then linked to the
//!    customer ID so later events resolve at step 3

use std::sync::Arc;

use thiserror::Error;

use crate::error::BillingResult;
use crate::events::ProviderEvent;
use crate::profiles::ProfileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Metadata,
    ClientReference,
    CustomerId,
    Email,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::Metadata => "metadata",
            IdentitySource::ClientReference => "client_reference_id",
            IdentitySource::CustomerId => "customer_id",
            IdentitySource::Email => "email",
        }
    }
}

/// The user an event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    /// Best known address: the event's, else the stored profile's
    pub email: Option<String>,
    pub source: IdentitySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no user matches customer {customer_id:?} / email {email:?}")]
pub struct IdentityUnresolved {
    pub customer_id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(UserIdentity),
    Unresolved(IdentityUnresolved),
}

pub struct IdentityResolver {
    profiles: Arc<dyn ProfileStore>,
}

impl IdentityResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }

    pub async fn resolve(&self, event: &ProviderEvent) -> BillingResult<Resolution> {
        let event_email = event.email().map(str::to_string);

        if let Some(user_id) = event.metadata_user_id() {
            return Ok(Resolution::Resolved(UserIdentity {
                user_id: user_id.to_string(),
                email: event_email,
                source: IdentitySource::Metadata,
            }));
        }

        if let Some(user_id) = event.client_reference_id() {
            return Ok(Resolution::Resolved(UserIdentity {
                user_id: user_id.to_string(),
                email: event_email,
                source: IdentitySource::ClientReference,
            }));
        }

        let customer_id = event.customer_id();

        if let Some(customer_id) = customer_id {
            if let Some(profile) = self.profiles.find_by_customer_id(customer_id).await? {
                return Ok(Resolution::Resolved(UserIdentity {
                    user_id: profile.user_id,
                    email: event_email.or(profile.email),
                    source: IdentitySource::CustomerId,
                }));
            }
        }

        if let Some(email) = event.email() {
            if let Some(profile) = self.profiles.find_by_email(email).await? {
                if let Some(customer_id) = customer_id {
                    match profile.provider_customer_id.as_deref() {
                        Some(existing) if existing == customer_id => {}
                        Some(existing) => {
                            tracing::warn!(
                                event_id = %event.id,
                                user_id = %profile.user_id,
                                previous_customer_id = %existing,
                                customer_id = %customer_id,
                                "Email match carries a different customer ID, reassigning"
                            );
                            self.profiles
                                .assign_customer_id(&profile.user_id, customer_id)
                                .await?;
                        }
                        None => {
                            tracing::info!(
                                event_id = %event.id,
                                user_id = %profile.user_id,
                                customer_id = %customer_id,
                                "Backfilled customer ID from email match"
                            );
                            self.profiles
                                .assign_customer_id(&profile.user_id, customer_id)
                                .await?;
                        }
                    }
                }

                return Ok(Resolution::Resolved(UserIdentity {
                    user_id: profile.user_id,
                    email: Some(email.to_string()),
                    source: IdentitySource::Email,
                }));
            }
        }

        Ok(Resolution::Unresolved(IdentityUnresolved {
            customer_id: customer_id.map(str::to_string),
            email: event_email,
        }))
    }
}
