//! Application state

use std::sync::Arc;

use sprouttie_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        Self {
            config: Arc::new(config),
            billing: Arc::new(billing),
        }
    }
}
