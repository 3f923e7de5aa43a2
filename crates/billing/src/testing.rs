//! Fakes shared by the crate's unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::email::{EmailMessage, EmailSender, NotificationError, PlanActivationNotifier};
use crate::error::{BillingError, BillingResult};
use crate::idempotency::InMemoryEventLedger;
use crate::plans::{BillingCycle, PlanTier, PriceCatalog};
use crate::profiles::{InMemoryProfileStore, ProfileChange, ProfileStore, UserProfile};
use crate::provider::{CheckoutSessionRequest, PaymentProvider, SubscriptionSnapshot};
use crate::signature::WebhookVerifier;
use crate::webhooks::WebhookHandler;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub const PRINT_MONTHLY: &str = "price_print_m";
pub const PRINT_ANNUAL: &str = "price_print_y";
pub const PRO_MONTHLY: &str = "price_pro_m";
pub const PRO_ANNUAL: &str = "price_pro_y";

pub fn catalog() -> PriceCatalog {
    PriceCatalog::new([
        (PRINT_MONTHLY, PlanTier::Print, BillingCycle::Monthly),
        (PRINT_ANNUAL, PlanTier::Print, BillingCycle::Annual),
        (PRO_MONTHLY, PlanTier::Pro, BillingCycle::Monthly),
        (PRO_ANNUAL, PlanTier::Pro, BillingCycle::Annual),
    ])
}

/// In-process stand-in for Stripe
#[derive(Default)]
pub struct FakeProvider {
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    pub checkout_requests: Mutex<Vec<CheckoutSessionRequest>>,
    pub portal_requests: Mutex<Vec<(String, String)>>,
    pub retrievals: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, id: &str, customer_id: &str, price_id: &str) -> Self {
        self.subscriptions.lock().unwrap().insert(
            id.to_string(),
            SubscriptionSnapshot {
                id: id.to_string(),
                customer_id: customer_id.to_string(),
                price_id: Some(price_id.to_string()),
                status: "active".to_string(),
                current_period_end: Some(1_800_000_000),
                cancel_at_period_end: false,
            },
        );
        self
    }

    /// Every call fails as if Stripe were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi("service unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.check_available()?;
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ProviderRejected(format!("No such subscription: {subscription_id}")))
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<String> {
        self.check_available()?;
        self.checkout_requests.lock().unwrap().push(request.clone());
        Ok(format!("https://checkout.stripe.test/{}", request.user_id))
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String> {
        self.check_available()?;
        self.portal_requests
            .lock()
            .unwrap()
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(format!("https://billing.stripe.test/{customer_id}"))
    }
}

/// Sender that records messages, optionally failing every send
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<EmailMessage>>,
    fail: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sender = Self::default();
        sender.fail.store(true, Ordering::SeqCst);
        sender
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Delivery("smtp relay refused".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Sign a JSON event the way Stripe would
pub fn signed(secret: &str, value: &serde_json::Value) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(value).unwrap();
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let header = crate::signature::sign_payload(secret, now, &body);
    (body, header)
}

/// Profile store whose writes can be made to fail like a lost connection
#[derive(Default)]
pub struct FlakyProfileStore {
    inner: InMemoryProfileStore,
    failing: AtomicBool,
}

impl FlakyProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryProfileStore {
        &self.inner
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.inner.write_count()
    }

    fn check(&self) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Database("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FlakyProfileStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        self.inner.find_by_user_id(user_id).await
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<UserProfile>> {
        self.inner.find_by_customer_id(customer_id).await
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>> {
        self.inner.find_by_email(email).await
    }

    async fn assign_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        self.check()?;
        self.inner.assign_customer_id(user_id, customer_id).await
    }

    async fn apply_change(
        &self,
        user_id: &str,
        change: &ProfileChange,
    ) -> BillingResult<UserProfile> {
        self.check()?;
        self.inner.apply_change(user_id, change).await
    }
}

/// A webhook handler wired to in-memory collaborators
pub struct Harness {
    pub handler: WebhookHandler,
    pub ledger: Arc<InMemoryEventLedger>,
    pub profiles: Arc<FlakyProfileStore>,
    pub provider: Arc<FakeProvider>,
    pub sender: Arc<RecordingSender>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RecordingSender::new())
    }

    pub fn with_failing_email() -> Self {
        Self::build(RecordingSender::failing())
    }

    fn build(sender: RecordingSender) -> Self {
        let ledger = Arc::new(InMemoryEventLedger::new());
        let profiles = Arc::new(FlakyProfileStore::new());
        let provider = Arc::new(FakeProvider::new().with_subscription("sub_1", "cus_1", PRO_MONTHLY));
        let sender = Arc::new(sender);

        let handler = WebhookHandler::new(
            WebhookVerifier::new(WEBHOOK_SECRET, 300),
            ledger.clone(),
            profiles.clone(),
            Arc::new(catalog()),
            provider.clone(),
            PlanActivationNotifier::new(sender.clone(), Duration::from_secs(1)),
        );

        Self {
            handler,
            ledger,
            profiles,
            provider,
            sender,
        }
    }

    /// Wait for detached email tasks to deliver `count` messages
    pub async fn wait_for_emails(&self, count: usize) -> bool {
        for _ in 0..100 {
            if self.sender.sent_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
