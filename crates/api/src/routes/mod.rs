//! HTTP routes

mod admin;
mod checkout;
mod health;
mod webhooks;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use checkout::{CheckoutRequest, PortalRequest};

/// Route table without middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/stripe-webhook", post(webhooks::stripe_webhook))
        .route(
            "/create-checkout-session",
            post(checkout::create_checkout_session),
        )
        .route(
            "/create-portal-session",
            post(checkout::create_portal_session),
        )
        .route("/admin/webhooks", get(admin::list_webhooks))
        .with_state(state)
}

/// Restricts cross-origin requests to the configured allowlist
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Skipping unparseable CORS origin");
                None
            }
        })
        .collect();

    tracing::info!(
        allowed_origins = ?origins,
        "CORS configured with {} allowed origins",
        origins.len()
    );

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Router with CORS and request tracing applied
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
