//! Checkout and billing portal endpoints

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use sprouttie_billing::{BillingCycle, CheckoutResponse, PortalResponse};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan: String,
    pub user_id: String,
    pub email: Option<String>,
    pub billing_cycle: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub user_id: String,
}

/// `POST /create-checkout-session`
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    tracing::info!(
        plan = %req.plan,
        user_id = %req.user_id,
        billing_cycle = ?req.billing_cycle,
        "Checkout requested"
    );

    let cycle = match req.billing_cycle.as_deref() {
        None => BillingCycle::default(),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid billing cycle '{}'", raw)))?,
    };

    let response = state
        .billing
        .checkout
        .create_checkout_session(&req.plan, cycle, &req.user_id, req.email.as_deref())
        .await?;

    Ok(Json(response))
}

/// `POST /create-portal-session`
pub async fn create_portal_session(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<PortalResponse>> {
    let response = state
        .billing
        .portal
        .create_portal_session(req.user_id.trim())
        .await?;
    Ok(Json(response))
}
