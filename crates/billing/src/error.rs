//! Billing error types

use thiserror::Error;

use crate::signature::SignatureError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature invalid: {0}")]
    WebhookSignatureInvalid(#[from] SignatureError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    /// Stripe refused the request itself (4xx other than 429)
    #[error("Stripe rejected request: {0}")]
    ProviderRejected(String),

    #[error("Stripe request timed out after {0}s")]
    ProviderTimeout(u64),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the provider should redeliver the webhook that produced this error.
    ///
    /// Storage and provider outages are transient; everything else, including
    /// a request Stripe rejects outright, will fail the same way on every
    /// redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::StripeApi(_) | BillingError::ProviderTimeout(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

fn is_permanent_status(http_status: u16) -> bool {
    (400..500).contains(&http_status) && http_status != 429
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match &e {
            stripe::StripeError::Stripe(request) if is_permanent_status(request.http_status) => {
                BillingError::ProviderRejected(e.to_string())
            }
            _ => BillingError::StripeApi(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(BillingError::Database("connection refused".into()).is_retryable());
        assert!(BillingError::StripeApi("503".into()).is_retryable());
        assert!(BillingError::ProviderTimeout(10).is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!BillingError::WebhookSignatureInvalid(SignatureError::MissingHeader).is_retryable());
        assert!(!BillingError::InvalidPlan("gold".into()).is_retryable());
        assert!(!BillingError::NotFound("user".into()).is_retryable());
        assert!(!BillingError::ProviderRejected("resource_missing".into()).is_retryable());
    }

    #[test]
    fn test_stripe_status_classification() {
        assert!(is_permanent_status(400));
        assert!(is_permanent_status(404));
        assert!(!is_permanent_status(429));
        assert!(!is_permanent_status(500));
        assert!(!is_permanent_status(503));
    }

    #[test]
    fn test_stripe_client_errors_stay_retryable() {
        let err = BillingError::from(stripe::StripeError::ClientError("connection reset".into()));
        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(err.is_retryable());
    }
}
