//! Stripe webhook endpoint

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use sprouttie_billing::{BillingError, WebhookOutcome};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// `POST /stripe-webhook`
///
/// Takes the raw body so the signature is checked against the exact bytes
/// Stripe signed.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature)
        .await
        .map_err(|e| {
            match &e {
                BillingError::WebhookSignatureInvalid(reason) => tracing::warn!(
                    reason = %reason,
                    body_len = body.len(),
                    "Rejected webhook with invalid signature"
                ),
                other => tracing::error!(error = %other, "Webhook processing failed"),
            }
            ApiError::from(e)
        })?;

    if let WebhookOutcome::Rejected { reason } = &outcome {
        tracing::warn!(reason = %reason, "Acknowledged webhook that could not be applied");
    } else {
        tracing::debug!(outcome = ?outcome, "Acknowledged webhook");
    }

    Ok(Json(json!({ "received": true })))
}
