// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sprouttie API Library
//!
//! HTTP surface for Sprouttie billing: the Stripe webhook receiver and the
//! checkout and billing portal session endpoints.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::{create_app, create_router};
pub use state::AppState;
