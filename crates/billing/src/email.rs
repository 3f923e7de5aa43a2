//! Plan activation emails
//!
//! Sending is best effort. [`PlanActivationNotifier::dispatch`] runs the send
//! in its own task under a timeout, so a slow or failing mail provider can
//! neither delay the webhook acknowledgment nor undo a reconciled profile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::plans::PlanTier;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("email delivery failed: {0}")]
    Delivery(String),
    #[error("email send timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError>;
}

/// Resend credentials. Without an API key, sends are skipped.
#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Sprouttie <billing@sprouttie.com>".to_string()),
        }
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// [`EmailSender`] backed by the Resend HTTP API
#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.resend_api_key.is_some()
    }
}

#[async_trait]
impl EmailSender for BillingEmailService {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        let Some(api_key) = self.config.resend_api_key.as_deref() else {
            tracing::info!(to = %message.to, subject = %message.subject, "Email disabled, skipping send");
            return Ok(());
        };

        let response = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&ResendRequest {
                from: &self.config.from,
                to: [&message.to],
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Delivery(format!("{}: {}", status, body)));
        }

        tracing::debug!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}

fn activation_message(plan: PlanTier, email: &str) -> EmailMessage {
    EmailMessage {
        to: email.to_string(),
        subject: format!("Your Sprouttie {} plan is active", plan.display_name()),
        html: format!(
            "<p>Thanks for subscribing!</p>\
             <p>Your <strong>{}</strong> plan is now active. You can manage your \
             subscription at any time from your account page.</p>",
            plan.display_name()
        ),
    }
}

/// Sends the plan activation email after a checkout is reconciled
#[derive(Clone)]
pub struct PlanActivationNotifier {
    sender: Arc<dyn EmailSender>,
    timeout: Duration,
}

impl PlanActivationNotifier {
    pub fn new(sender: Arc<dyn EmailSender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    /// Send and wait, bounded by the timeout
    pub async fn notify(&self, plan: PlanTier, email: &str) -> Result<(), NotificationError> {
        tokio::time::timeout(self.timeout, self.sender.send(activation_message(plan, email)))
            .await
            .map_err(|_| NotificationError::Timeout(self.timeout))?
    }

    /// Fire and forget. Failures are logged and go nowhere else.
    pub fn dispatch(&self, event_id: &str, plan: PlanTier, email: &str) -> JoinHandle<()> {
        let notifier = self.clone();
        let event_id = event_id.to_string();
        let email = email.to_string();

        tokio::spawn(async move {
            match notifier.notify(plan, &email).await {
                Ok(()) => tracing::info!(
                    event_id = %event_id,
                    plan = %plan,
                    "Plan activation email sent"
                ),
                Err(e) => tracing::error!(
                    event_id = %event_id,
                    plan = %plan,
                    error = %e,
                    "Failed to send plan activation email"
                ),
            }
        })
    }
}
