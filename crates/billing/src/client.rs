//! Stripe client and configuration

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CustomerId, Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutSessionRequest, PaymentProvider, SubscriptionSnapshot};

/// Default tolerance between the signed timestamp and now
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Default bound on any single Stripe API call
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Configured Stripe price IDs, one per tier and billing cycle
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub print_monthly: Option<String>,
    pub print_annual: Option<String>,
    pub pro_monthly: Option<String>,
    pub pro_annual: Option<String>,
}

impl PriceIds {
    /// Read price IDs from the environment.
    ///
    /// `PRICE_ID_Print` and `PRICE_ID_PRO` are accepted as the monthly prices
    /// for deployments that predate annual billing.
    pub fn from_env() -> Self {
        Self {
            print_monthly: env_non_empty("PRICE_ID_PRINT_MONTHLY")
                .or_else(|| env_non_empty("PRICE_ID_Print")),
            print_annual: env_non_empty("PRICE_ID_PRINT_ANNUAL"),
            pro_monthly: env_non_empty("PRICE_ID_PRO_MONTHLY")
                .or_else(|| env_non_empty("PRICE_ID_PRO")),
            pro_annual: env_non_empty("PRICE_ID_PRO_ANNUAL"),
        }
    }

    /// Price IDs with the middle elided, safe for boot logs
    pub fn masked(&self) -> HashMap<&'static str, String> {
        let mut out = HashMap::new();
        for (name, value) in [
            ("print_monthly", &self.print_monthly),
            ("print_annual", &self.print_annual),
            ("pro_monthly", &self.pro_monthly),
            ("pro_annual", &self.pro_annual),
        ] {
            out.insert(
                name,
                value.as_deref().map(mask_price_id).unwrap_or_else(|| "<unset>".to_string()),
            );
        }
        out
    }
}

fn mask_price_id(id: &str) -> String {
    if id.starts_with("price_") && id.len() > 14 {
        format!("{}...{}", &id[..8], &id[id.len() - 6..])
    } else {
        id.to_string()
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub request_timeout: Duration,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = env_non_empty("STRIPE_SECRET_KEY")
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY must be set".to_string()))?;
        let webhook_secret = env_non_empty("STRIPE_WEBHOOK_SECRET")
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))?;

        let webhook_tolerance_secs = parse_env("WEBHOOK_TOLERANCE_SECS")?
            .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS);
        let timeout_secs =
            parse_env("PROVIDER_TIMEOUT_SECS")?.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS);

        Ok(Self {
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
            request_timeout: Duration::from_secs(timeout_secs),
            price_ids: PriceIds::from_env(),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> BillingResult<Option<T>> {
    match env_non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(None),
    }
}

/// Thin wrapper over the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Bound a Stripe call by the configured request timeout
    async fn bounded<T, F>(&self, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => Err(BillingError::ProviderTimeout(timeout.as_secs())),
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let subscription = self
            .bounded(Subscription::retrieve(&self.inner, &sub_id, &[]))
            .await?;

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        tracing::debug!(
            subscription_id = %subscription.id,
            price_id = ?price_id,
            status = %subscription.status.as_str(),
            "Retrieved subscription from Stripe"
        );

        Ok(SubscriptionSnapshot {
            id: subscription.id.to_string(),
            customer_id: subscription.customer.id().to_string(),
            price_id,
            status: subscription.status.as_str().to_string(),
            current_period_end: Some(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.clone());
        metadata.insert("plan".to_string(), request.plan.to_string());
        metadata.insert("billing_cycle".to_string(), request.cycle.as_str().to_string());

        let customer = match &request.customer_id {
            Some(id) => Some(
                id.parse::<CustomerId>()
                    .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?,
            ),
            None => None,
        };

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(request.success_url.as_str());
        params.cancel_url = Some(request.cancel_url.as_str());
        params.client_reference_id = Some(request.user_id.as_str());
        // Stripe rejects customer_email alongside an existing customer
        if customer.is_none() {
            params.customer_email = request.email.as_deref();
        }
        params.customer = customer;
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = self.bounded(CheckoutSession::create(&self.inner, params)).await?;

        tracing::info!(
            session_id = %session.id,
            user_id = %request.user_id,
            plan = %request.plan,
            "Created checkout session"
        );

        session
            .url
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = self
            .bounded(BillingPortalSession::create(&self.inner, params))
            .await?;

        Ok(session.url)
    }
}
