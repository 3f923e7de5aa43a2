//! Applies a resolved event to the user's subscription record
//!
//! | Event | Effect |
//! |---|---|
//! | checkout completed | plan from metadata, else line-item price, else the live subscription's price; status `active`; link customer and subscription |
//! | subscription created / updated | plan recomputed from the current price; status verbatim; period end and cancel flag |
//! | subscription deleted, final payment failure | plan `free`, status `canceled`; period end retained |
//! | invoice payment succeeded | period end and customer ID; plan only for a profile that does not exist yet |
//!
//! Period-end writes are ordered: an older value never replaces a newer one
//! unless the write comes from a cancellation. The check runs inside the
//! store's conditional write, not here.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::{
    CheckoutCompleted, EventKind, InvoicePayment, ProviderEvent, SubscriptionChange,
    SubscriptionEnded,
};
use crate::identity::UserIdentity;
use crate::plans::{PlanTier, PriceCatalog};
use crate::profiles::{PeriodEndWrite, ProfileChange, ProfileStore, UserProfile};
use crate::provider::{PaymentProvider, SubscriptionSnapshot};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_CANCELED: &str = "canceled";

/// Subscription statuses after which the subscription grants nothing
const ENDED_STATUSES: [&str; 2] = [STATUS_CANCELED, "incomplete_expired"];

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationOutcome {
    Applied {
        user_id: String,
        plan: PlanTier,
        subscription_status: Option<String>,
        current_period_end: Option<OffsetDateTime>,
        email: Option<String>,
    },
    /// The price is not in the catalog; linkage was written but not the plan
    UnknownPrice {
        user_id: String,
        price_id: Option<String>,
    },
    /// Nothing to write
    NoChange { user_id: String, reason: &'static str },
}

/// Where a plan came from, or the price that failed to map
#[derive(Debug, Clone, PartialEq)]
enum PlanLookup {
    Plan(PlanTier),
    Unknown(Option<String>),
}

/// What to do with a profile, decided before anything is written
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Write {
        change: ProfileChange,
        unknown_price: Option<Option<String>>,
    },
    Skip(&'static str),
}

fn to_datetime(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// An event about a subscription other than the one the profile now holds
fn is_superseded(stored: Option<&UserProfile>, subscription_id: &str) -> bool {
    stored
        .and_then(|p| p.provider_subscription_id.as_deref())
        .is_some_and(|current| current != subscription_id)
}

/// A late non-cancel event for a subscription already stored as canceled
fn is_resurrection(stored: Option<&UserProfile>, change: &SubscriptionChange) -> bool {
    let Some(profile) = stored else {
        return false;
    };
    profile.provider_subscription_id.as_deref() == Some(change.subscription_id.as_str())
        && profile.subscription_status.as_deref() == Some(STATUS_CANCELED)
        && !ENDED_STATUSES.contains(&change.status.as_str())
}

/// A checkout replayed after its subscription was canceled
fn is_canceled_checkout(stored: Option<&UserProfile>, checkout: &CheckoutCompleted) -> bool {
    let (Some(profile), Some(subscription_id)) = (stored, checkout.subscription_id.as_deref()) else {
        return false;
    };
    profile.provider_subscription_id.as_deref() == Some(subscription_id)
        && profile.subscription_status.as_deref() == Some(STATUS_CANCELED)
}

fn email_backfill(stored: Option<&UserProfile>, identity: &UserIdentity) -> Option<String> {
    match stored {
        Some(profile) if profile.email.is_some() => None,
        _ => identity.email.clone(),
    }
}

fn with_plan(mut change: ProfileChange, lookup: PlanLookup) -> Decision {
    match lookup {
        PlanLookup::Plan(plan) => {
            change.plan = Some(plan);
            Decision::Write {
                change,
                unknown_price: None,
            }
        }
        PlanLookup::Unknown(price_id) => Decision::Write {
            change,
            unknown_price: Some(price_id),
        },
    }
}

fn decide_checkout(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    checkout: &CheckoutCompleted,
    lookup: PlanLookup,
    snapshot: Option<&SubscriptionSnapshot>,
) -> Decision {
    let change = match lookup {
        PlanLookup::Plan(_) => ProfileChange {
            email: email_backfill(stored, identity),
            provider_customer_id: checkout.customer_id.clone(),
            provider_subscription_id: checkout.subscription_id.clone(),
            subscription_status: Some(STATUS_ACTIVE.to_string()),
            current_period_end: to_datetime(snapshot.and_then(|s| s.current_period_end))
                .map(PeriodEndWrite::guarded),
            cancel_at_period_end: Some(snapshot.is_some_and(|s| s.cancel_at_period_end)),
            ..Default::default()
        },
        // Without a plan only the linkage is trustworthy
        PlanLookup::Unknown(_) => ProfileChange {
            email: email_backfill(stored, identity),
            provider_customer_id: checkout.customer_id.clone(),
            provider_subscription_id: checkout.subscription_id.clone(),
            ..Default::default()
        },
    };
    with_plan(change, lookup)
}

fn decide_subscription_change(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    subscription: &SubscriptionChange,
    lookup: PlanLookup,
) -> Decision {
    if is_superseded(stored, &subscription.subscription_id)
        && !ENDED_STATUSES.contains(&subscription.status.as_str())
        && stored.and_then(|p| p.subscription_status.as_deref()) == Some(STATUS_ACTIVE)
    {
        return Decision::Skip("event is for a replaced subscription");
    }
    if is_resurrection(stored, subscription) {
        return Decision::Skip("subscription already canceled");
    }

    let change = ProfileChange {
        email: email_backfill(stored, identity),
        provider_customer_id: Some(subscription.customer_id.clone()),
        provider_subscription_id: Some(subscription.subscription_id.clone()),
        subscription_status: Some(subscription.status.clone()),
        current_period_end: to_datetime(subscription.current_period_end)
            .map(PeriodEndWrite::guarded),
        cancel_at_period_end: Some(subscription.cancel_at_period_end),
        ..Default::default()
    };
    with_plan(change, lookup)
}

fn decide_cancellation(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    customer_id: &str,
    subscription_id: &str,
    period_end: Option<PeriodEndWrite>,
) -> Decision {
    if is_superseded(stored, subscription_id) {
        return Decision::Skip("event is for a replaced subscription");
    }

    Decision::Write {
        change: ProfileChange {
            email: email_backfill(stored, identity),
            provider_customer_id: Some(customer_id.to_string()),
            provider_subscription_id: Some(subscription_id.to_string()),
            plan: Some(PlanTier::Free),
            subscription_status: Some(STATUS_CANCELED.to_string()),
            current_period_end: period_end,
            cancel_at_period_end: Some(false),
        },
        unknown_price: None,
    }
}

fn decide_deletion(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    ended: &SubscriptionEnded,
) -> Decision {
    // A cancellation's own period end always wins; without one the stored
    // value is the grace boundary.
    decide_cancellation(
        identity,
        stored,
        &ended.customer_id,
        &ended.subscription_id,
        to_datetime(ended.current_period_end).map(PeriodEndWrite::forced),
    )
}

fn decide_payment_failed(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    invoice: &InvoicePayment,
) -> Decision {
    match (&invoice.subscription_id, invoice.is_final_failure()) {
        (Some(subscription_id), true) => decide_cancellation(
            identity,
            stored,
            &invoice.customer_id,
            subscription_id,
            None,
        ),
        _ => Decision::Skip("payment will be retried"),
    }
}

fn decide_payment_succeeded(
    identity: &UserIdentity,
    stored: Option<&UserProfile>,
    invoice: &InvoicePayment,
    lookup: Option<PlanLookup>,
) -> Decision {
    let change = ProfileChange {
        email: email_backfill(stored, identity),
        provider_customer_id: Some(invoice.customer_id.clone()),
        current_period_end: to_datetime(invoice.period_end).map(PeriodEndWrite::guarded),
        ..Default::default()
    };
    match lookup {
        Some(lookup) => with_plan(change, lookup),
        None if change.is_empty() => Decision::Skip("nothing to refresh"),
        None => Decision::Write {
            change,
            unknown_price: None,
        },
    }
}

pub struct StateReconciler {
    profiles: Arc<dyn ProfileStore>,
    catalog: Arc<PriceCatalog>,
    provider: Arc<dyn PaymentProvider>,
}

impl StateReconciler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        catalog: Arc<PriceCatalog>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            profiles,
            catalog,
            provider,
        }
    }

    /// Apply `event` to the profile of `identity`.
    ///
    /// Depends only on the event and the stored profile, so running it again
    /// after a failed attempt converges on the same state.
    pub async fn apply(
        &self,
        identity: &UserIdentity,
        event: &ProviderEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let stored = self.profiles.find_by_user_id(&identity.user_id).await?;
        let stored = stored.as_ref();

        let decision = match &event.kind {
            EventKind::CheckoutCompleted(checkout) if is_canceled_checkout(stored, checkout) => {
                Decision::Skip("subscription already canceled")
            }
            EventKind::CheckoutCompleted(checkout) => {
                let (lookup, snapshot) = self.checkout_plan(event, checkout).await?;
                decide_checkout(identity, stored, checkout, lookup, snapshot.as_ref())
            }
            EventKind::SubscriptionCreated(subscription)
            | EventKind::SubscriptionUpdated(subscription) => {
                let lookup = self.subscription_plan(event, subscription).await?;
                decide_subscription_change(identity, stored, subscription, lookup)
            }
            EventKind::SubscriptionDeleted(ended) => decide_deletion(identity, stored, ended),
            EventKind::InvoicePaymentSucceeded(invoice) => {
                let lookup = match stored {
                    Some(_) => None,
                    None => Some(self.invoice_plan(event, invoice).await?),
                };
                decide_payment_succeeded(identity, stored, invoice, lookup)
            }
            EventKind::InvoicePaymentFailed(invoice) => {
                decide_payment_failed(identity, stored, invoice)
            }
            EventKind::Ignored { .. } => Decision::Skip("event kind not handled"),
        };

        let (change, unknown_price) = match decision {
            Decision::Skip(reason) => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %identity.user_id,
                    reason = reason,
                    "No profile change for event"
                );
                return Ok(ReconciliationOutcome::NoChange {
                    user_id: identity.user_id.clone(),
                    reason,
                });
            }
            Decision::Write {
                change,
                unknown_price,
            } => (change, unknown_price),
        };

        if let (Some(previous), Some(incoming)) = (
            stored.and_then(|p| p.provider_customer_id.as_deref()),
            change.provider_customer_id.as_deref(),
        ) {
            if previous != incoming {
                tracing::warn!(
                    event_id = %event.id,
                    user_id = %identity.user_id,
                    previous_customer_id = %previous,
                    customer_id = %incoming,
                    "Customer ID mismatch, reassigning"
                );
            }
        }

        let profile = self
            .profiles
            .apply_change(&identity.user_id, &change)
            .await?;

        if let Some(price_id) = unknown_price {
            return Ok(ReconciliationOutcome::UnknownPrice {
                user_id: profile.user_id,
                price_id,
            });
        }

        tracing::info!(
            event_id = %event.id,
            user_id = %profile.user_id,
            plan = %profile.plan,
            subscription_status = ?profile.subscription_status,
            "Profile reconciled"
        );

        Ok(ReconciliationOutcome::Applied {
            user_id: profile.user_id,
            plan: profile.plan,
            subscription_status: profile.subscription_status,
            current_period_end: profile.current_period_end,
            email: profile.email,
        })
    }

    fn lookup_price(&self, event: &ProviderEvent, price_id: Option<&str>) -> PlanLookup {
        let Some(price_id) = price_id else {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Event carries no price to derive a plan from"
            );
            return PlanLookup::Unknown(None);
        };

        match self.catalog.plan_for_price(price_id) {
            Ok(plan) => PlanLookup::Plan(plan),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    price_id = %price_id,
                    error = %e,
                    "Unknown price ID, check the configured price catalog"
                );
                PlanLookup::Unknown(Some(price_id.to_string()))
            }
        }
    }

    async fn checkout_plan(
        &self,
        event: &ProviderEvent,
        checkout: &CheckoutCompleted,
    ) -> BillingResult<(PlanLookup, Option<SubscriptionSnapshot>)> {
        if let Some(raw) = checkout.metadata.get("plan") {
            match raw.parse::<PlanTier>() {
                Ok(plan) if plan.is_paid() => return Ok((PlanLookup::Plan(plan), None)),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    event_id = %event.id,
                    plan = %raw,
                    error = %e,
                    "Ignoring unrecognised plan in checkout metadata"
                ),
            }
        }

        if let Some(price_id) = checkout.price_id.as_deref() {
            return Ok((self.lookup_price(event, Some(price_id)), None));
        }

        let Some(subscription_id) = checkout.subscription_id.as_deref() else {
            return Ok((self.lookup_price(event, None), None));
        };

        let snapshot = self.provider.retrieve_subscription(subscription_id).await?;
        let lookup = self.lookup_price(event, snapshot.price_id.as_deref());
        Ok((lookup, Some(snapshot)))
    }

    async fn subscription_plan(
        &self,
        event: &ProviderEvent,
        subscription: &SubscriptionChange,
    ) -> BillingResult<PlanLookup> {
        if ENDED_STATUSES.contains(&subscription.status.as_str()) {
            return Ok(PlanLookup::Plan(PlanTier::Free));
        }
        match subscription.price_id.as_deref() {
            Some(price_id) => Ok(self.lookup_price(event, Some(price_id))),
            None => {
                let snapshot = self
                    .provider
                    .retrieve_subscription(&subscription.subscription_id)
                    .await?;
                Ok(self.lookup_price(event, snapshot.price_id.as_deref()))
            }
        }
    }

    async fn invoice_plan(
        &self,
        event: &ProviderEvent,
        invoice: &InvoicePayment,
    ) -> BillingResult<PlanLookup> {
        if invoice.price_id.is_some() {
            return Ok(self.lookup_price(event, invoice.price_id.as_deref()));
        }
        match invoice.subscription_id.as_deref() {
            Some(subscription_id) => {
                let snapshot = self.provider.retrieve_subscription(subscription_id).await?;
                Ok(self.lookup_price(event, snapshot.price_id.as_deref()))
            }
            None => Ok(self.lookup_price(event, None)),
        }
    }
}
