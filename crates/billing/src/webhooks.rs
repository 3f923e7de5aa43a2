//! Stripe webhook handling
//!
//! One verified event flows through: ledger claim, identity resolution,
//! reconciliation, ledger completion, then (for checkouts) the activation
//! email. The claim happens before anything is written and is never rolled
//! back, so every event mutates state at most once.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::email::PlanActivationNotifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, ProviderEvent};
use crate::identity::{IdentityResolver, IdentityUnresolved, Resolution};
use crate::idempotency::{ClaimOutcome, EventLedger, ProcessedEventRecord, ProcessingStatus};
use crate::plans::PriceCatalog;
use crate::profiles::ProfileStore;
use crate::provider::PaymentProvider;
use crate::reconcile::{ReconciliationOutcome, StateReconciler};
use crate::signature::WebhookVerifier;

/// Upper bound on records returned by one listing
pub const MAX_LIST_LIMIT: i64 = 500;

/// What happened to one delivery. Every variant is acknowledged with 200.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Reconciled(ReconciliationOutcome),
    /// Already claimed by an earlier or concurrent delivery
    Duplicate { status: Option<ProcessingStatus> },
    Ignored { event_type: String },
    IdentityUnresolved(IdentityUnresolved),
    /// Failed in a way a redelivery would repeat
    Rejected { reason: String },
}

impl WebhookOutcome {
    /// Final ledger status, or `None` when this delivery did not own the claim
    pub fn ledger_status(&self) -> Option<ProcessingStatus> {
        match self {
            WebhookOutcome::Reconciled(ReconciliationOutcome::UnknownPrice { .. }) => {
                Some(ProcessingStatus::UnknownPrice)
            }
            WebhookOutcome::Reconciled(_) => Some(ProcessingStatus::Success),
            WebhookOutcome::Duplicate { .. } => None,
            WebhookOutcome::Ignored { .. } => Some(ProcessingStatus::Ignored),
            WebhookOutcome::IdentityUnresolved(_) => Some(ProcessingStatus::Unresolved),
            WebhookOutcome::Rejected { .. } => Some(ProcessingStatus::Failed),
        }
    }
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    ledger: Arc<dyn EventLedger>,
    resolver: IdentityResolver,
    reconciler: StateReconciler,
    notifier: PlanActivationNotifier,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        ledger: Arc<dyn EventLedger>,
        profiles: Arc<dyn ProfileStore>,
        catalog: Arc<PriceCatalog>,
        provider: Arc<dyn PaymentProvider>,
        notifier: PlanActivationNotifier,
    ) -> Self {
        Self {
            verifier,
            ledger,
            resolver: IdentityResolver::new(profiles.clone()),
            reconciler: StateReconciler::new(profiles, catalog, provider),
            notifier,
        }
    }

    /// Verify a raw delivery and process it
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let event = self.verifier.verify(payload, signature)?;
        self.process(event).await
    }

    /// Process a verified event.
    ///
    /// `Err` is returned only for retryable failures, which the caller should
    /// answer with a 5xx so the provider redelivers. The ledger record is left
    /// in `error` and the redelivery re-claims it.
    pub async fn process(&self, event: ProviderEvent) -> BillingResult<WebhookOutcome> {
        let event_created_at = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let attempt = match self
            .ledger
            .claim(&event.id, &event.event_type, event_created_at)
            .await?
        {
            ClaimOutcome::Claimed { attempt } => attempt,
            ClaimOutcome::AlreadyProcessed { status } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = ?status,
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookOutcome::Duplicate { status });
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = attempt,
            "Processing Stripe webhook event"
        );

        let result = match self.process_claimed(&event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event failed permanently, acknowledging without retry"
                );
                Ok(WebhookOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
        };

        let (status, error_message) = match &result {
            Ok(WebhookOutcome::Rejected { reason }) => (ProcessingStatus::Failed, Some(reason.clone())),
            Ok(outcome) => (
                outcome.ledger_status().unwrap_or(ProcessingStatus::Success),
                None,
            ),
            Err(e) => (ProcessingStatus::Error, Some(e.to_string())),
        };
        self.complete(&event, status, error_message.as_deref()).await;

        if let Ok(WebhookOutcome::Reconciled(ReconciliationOutcome::Applied {
            plan,
            email: Some(email),
            ..
        })) = &result
        {
            if matches!(event.kind, EventKind::CheckoutCompleted(_)) && plan.is_paid() {
                self.notifier.dispatch(&event.id, *plan, email);
            }
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed, provider will redeliver"
            );
        }

        result
    }

    async fn process_claimed(&self, event: &ProviderEvent) -> BillingResult<WebhookOutcome> {
        if let EventKind::Ignored { event_type } = &event.kind {
            tracing::debug!(event_id = %event.id, event_type = %event_type, "Unhandled event type");
            return Ok(WebhookOutcome::Ignored {
                event_type: event_type.clone(),
            });
        }

        let identity = match self.resolver.resolve(event).await? {
            Resolution::Resolved(identity) => identity,
            Resolution::Unresolved(unresolved) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    customer_id = ?unresolved.customer_id,
                    email = ?unresolved.email,
                    "Could not resolve user for webhook event"
                );
                return Ok(WebhookOutcome::IdentityUnresolved(unresolved));
            }
        };

        tracing::debug!(
            event_id = %event.id,
            user_id = %identity.user_id,
            source = identity.source.as_str(),
            "Resolved webhook event to user"
        );

        let outcome = self.reconciler.apply(&identity, event).await?;
        Ok(WebhookOutcome::Reconciled(outcome))
    }

    /// Stamp the ledger record, retrying once
    async fn complete(
        &self,
        event: &ProviderEvent,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) {
        let Err(e) = self.ledger.complete(&event.id, status, error_message).await else {
            return;
        };

        tracing::warn!(
            event_id = %event.id,
            error = %e,
            "First attempt to update webhook event failed, retrying..."
        );

        if let Err(retry_err) = self.ledger.complete(&event.id, status, error_message).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                status = %status,
                error_message = ?error_message,
                first_error = %e,
                retry_error = %retry_err,
                "CRITICAL: Failed to update webhook ledger record after retry. \
                 Event may appear stuck in 'processing' until the stale timeout."
            );
        }
    }

    /// Ledger records for operators, newest first
    pub async fn list_webhooks(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedEventRecord>> {
        if limit <= 0 {
            return Err(BillingError::InvalidInput("limit must be positive".into()));
        }
        self.ledger.list(status, limit.min(MAX_LIST_LIMIT), offset.max(0)).await
    }
}
