//! Typed Stripe webhook events
//!
//! Only the event kinds the reconciler acts on are modelled; every other kind
//! parses to [`EventKind::Ignored`]. Each variant carries exactly the fields
//! its handler needs, pulled out of Stripe's loosely-shaped JSON here so the
//! rest of the crate never touches raw payloads.

use std::collections::HashMap;

use serde::Deserialize;

pub type Metadata = HashMap<String, String>;

/// A verified webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    /// Stripe's type string, e.g. `customer.subscription.updated`
    pub event_type: String,
    /// Unix timestamp the event was created at Stripe
    pub created: i64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionCreated(SubscriptionChange),
    SubscriptionUpdated(SubscriptionChange),
    SubscriptionDeleted(SubscriptionEnded),
    InvoicePaymentSucceeded(InvoicePayment),
    InvoicePaymentFailed(InvoicePayment),
    Ignored { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub client_reference_id: Option<String>,
    pub email: Option<String>,
    pub metadata: Metadata,
    /// Present only when line items were expanded on the event
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionChange {
    pub subscription_id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub status: String,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionEnded {
    pub subscription_id: String,
    pub customer_id: String,
    pub current_period_end: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvoicePayment {
    pub invoice_id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub email: Option<String>,
    pub price_id: Option<String>,
    pub period_end: Option<i64>,
    pub metadata: Metadata,
    pub next_payment_attempt: Option<i64>,
    pub attempt_count: u32,
}

impl InvoicePayment {
    /// A failed subscription invoice Stripe will not retry again
    pub fn is_final_failure(&self) -> bool {
        self.subscription_id.is_some() && self.next_payment_attempt.is_none()
    }
}

impl ProviderEvent {
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawEvent = serde_json::from_slice(payload)?;
        let object = raw.data.object;

        let kind = match raw.event_type.as_str() {
            "checkout.session.completed" => {
                EventKind::CheckoutCompleted(serde_json::from_value::<RawCheckoutSession>(object)?.into())
            }
            "customer.subscription.created" => {
                EventKind::SubscriptionCreated(serde_json::from_value::<RawSubscription>(object)?.into())
            }
            "customer.subscription.updated" => {
                EventKind::SubscriptionUpdated(serde_json::from_value::<RawSubscription>(object)?.into())
            }
            "customer.subscription.deleted" => {
                let change: SubscriptionChange =
                    serde_json::from_value::<RawSubscription>(object)?.into();
                EventKind::SubscriptionDeleted(SubscriptionEnded {
                    subscription_id: change.subscription_id,
                    customer_id: change.customer_id,
                    current_period_end: change.current_period_end,
                    metadata: change.metadata,
                })
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                EventKind::InvoicePaymentSucceeded(serde_json::from_value::<RawInvoice>(object)?.into())
            }
            "invoice.payment_failed" => {
                EventKind::InvoicePaymentFailed(serde_json::from_value::<RawInvoice>(object)?.into())
            }
            other => EventKind::Ignored {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            created: raw.created,
            kind,
        })
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match &self.kind {
            EventKind::CheckoutCompleted(c) => Some(&c.metadata),
            EventKind::SubscriptionCreated(s) | EventKind::SubscriptionUpdated(s) => Some(&s.metadata),
            EventKind::SubscriptionDeleted(s) => Some(&s.metadata),
            EventKind::InvoicePaymentSucceeded(i) | EventKind::InvoicePaymentFailed(i) => {
                Some(&i.metadata)
            }
            EventKind::Ignored { .. } => None,
        }
    }

    /// Internal user ID echoed back through metadata
    pub fn metadata_user_id(&self) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("user_id"))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn client_reference_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(c) => c.client_reference_id.as_deref(),
            _ => None,
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }

    pub fn customer_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(c) => c.customer_id.as_deref(),
            EventKind::SubscriptionCreated(s) | EventKind::SubscriptionUpdated(s) => {
                Some(s.customer_id.as_str())
            }
            EventKind::SubscriptionDeleted(s) => Some(s.customer_id.as_str()),
            EventKind::InvoicePaymentSucceeded(i) | EventKind::InvoicePaymentFailed(i) => {
                Some(i.customer_id.as_str())
            }
            EventKind::Ignored { .. } => None,
        }
        .filter(|s| !s.is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(c) => c.email.as_deref(),
            EventKind::InvoicePaymentSucceeded(i) | EventKind::InvoicePaymentFailed(i) => {
                i.email.as_deref()
            }
            _ => None,
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: serde_json::Value,
}

/// A reference Stripe may send either as an ID or as the expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct PriceRef {
    id: String,
}

#[derive(Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    client_reference_id: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CustomerDetails>,
    metadata: Option<Metadata>,
    line_items: Option<List<LineItem>>,
}

#[derive(Deserialize)]
struct LineItem {
    price: Option<PriceRef>,
}

impl From<RawCheckoutSession> for CheckoutCompleted {
    fn from(raw: RawCheckoutSession) -> Self {
        let email = raw
            .customer_email
            .or_else(|| raw.customer_details.and_then(|d| d.email));
        let price_id = raw
            .line_items
            .and_then(|items| items.data.into_iter().find_map(|item| item.price))
            .map(|price| price.id);

        Self {
            session_id: raw.id,
            customer_id: raw.customer.map(Expandable::into_id),
            subscription_id: raw.subscription.map(Expandable::into_id),
            client_reference_id: raw.client_reference_id,
            email,
            metadata: raw.metadata.unwrap_or_default(),
            price_id,
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: Expandable,
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    items: Option<List<SubscriptionItem>>,
    metadata: Option<Metadata>,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    price: Option<PriceRef>,
    // Newer API versions report the period per item
    current_period_end: Option<i64>,
}

impl From<RawSubscription> for SubscriptionChange {
    fn from(raw: RawSubscription) -> Self {
        let first_item = raw.items.and_then(|items| items.data.into_iter().next());
        let item_period_end = first_item.as_ref().and_then(|item| item.current_period_end);
        let price_id = first_item.and_then(|item| item.price).map(|price| price.id);

        Self {
            subscription_id: raw.id,
            customer_id: raw.customer.into_id(),
            price_id,
            status: raw.status,
            current_period_end: raw.current_period_end.or(item_period_end),
            cancel_at_period_end: raw.cancel_at_period_end,
            metadata: raw.metadata.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct RawInvoice {
    id: Option<String>,
    customer: Expandable,
    customer_email: Option<String>,
    subscription: Option<Expandable>,
    parent: Option<InvoiceParent>,
    subscription_details: Option<SubscriptionDetails>,
    lines: Option<List<InvoiceLine>>,
    next_payment_attempt: Option<i64>,
    attempt_count: Option<u32>,
    metadata: Option<Metadata>,
}

#[derive(Deserialize)]
struct InvoiceParent {
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Deserialize)]
struct SubscriptionDetails {
    subscription: Option<Expandable>,
    metadata: Option<Metadata>,
}

#[derive(Deserialize)]
struct InvoiceLine {
    price: Option<PriceRef>,
    pricing: Option<LinePricing>,
    period: Option<LinePeriod>,
}

#[derive(Deserialize)]
struct LinePricing {
    price_details: Option<PriceDetails>,
}

#[derive(Deserialize)]
struct PriceDetails {
    price: Option<String>,
}

#[derive(Deserialize)]
struct LinePeriod {
    end: Option<i64>,
}

impl From<RawInvoice> for InvoicePayment {
    fn from(raw: RawInvoice) -> Self {
        // Newer API versions moved subscription linkage under `parent`
        let details = raw
            .parent
            .and_then(|p| p.subscription_details)
            .or(raw.subscription_details);
        let (details_subscription, details_metadata) = match details {
            Some(d) => (d.subscription, d.metadata),
            None => (None, None),
        };

        let subscription_id = raw
            .subscription
            .or(details_subscription)
            .map(Expandable::into_id);

        let metadata = details_metadata
            .filter(|m| !m.is_empty())
            .or(raw.metadata)
            .unwrap_or_default();

        let first_line = raw.lines.and_then(|lines| lines.data.into_iter().next());
        let (price_id, period_end) = match first_line {
            Some(line) => {
                let price_id = line.price.map(|p| p.id).or_else(|| {
                    line.pricing
                        .and_then(|p| p.price_details)
                        .and_then(|d| d.price)
                });
                (price_id, line.period.and_then(|p| p.end))
            }
            None => (None, None),
        };

        Self {
            invoice_id: raw.id.unwrap_or_default(),
            customer_id: raw.customer.into_id(),
            subscription_id,
            email: raw.customer_email,
            price_id,
            period_end,
            metadata,
            next_payment_attempt: raw.next_payment_attempt,
            attempt_count: raw.attempt_count.unwrap_or(0),
        }
    }
}
