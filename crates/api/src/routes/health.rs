use axum::Json;
use serde_json::{json, Value};

/// `GET /`
pub async fn root() -> &'static str {
    "Sprouttie server running"
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
