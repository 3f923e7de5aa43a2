//! Operator endpoints

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::{Deserialize, Serialize};
use sprouttie_billing::webhooks::MAX_LIST_LIMIT;
use sprouttie_billing::{ProcessedEventRecord, ProcessingStatus};
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub events: Vec<ProcessedEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

/// Checks the `ADMIN_API_KEY` bearer token. Without a configured key the
/// operator routes do not exist.
fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return Err(ApiError::NotFound("Not found".into()));
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Rejected operator request with wrong token");
        Err(ApiError::Unauthorized)
    }
}

/// `GET /admin/webhooks?status=&limit=&offset=`
pub async fn list_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    require_admin(&state, &headers)?;

    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<ProcessingStatus>().map_err(ApiError::BadRequest)?),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state
        .billing
        .webhooks
        .list_webhooks(status, limit, offset)
        .await?;

    Ok(Json(WebhookListResponse {
        limit: limit.min(MAX_LIST_LIMIT),
        offset,
        events,
    }))
}
