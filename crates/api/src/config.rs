//! Server configuration from environment variables

use std::time::Duration;

use sprouttie_billing::email::DEFAULT_NOTIFY_TIMEOUT_SECS;
use sprouttie_billing::{BillingError, EmailConfig, StripeConfig};
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:5000";

/// Origins always allowed for local development
const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Billing(#[from] BillingError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Without a database the server runs on in-memory stores
    pub database_url: Option<String>,
    pub run_migrations: bool,
    pub frontend_url: String,
    pub allowed_origins: Vec<String>,
    pub notify_timeout: Duration,
    pub stripe: StripeConfig,
    pub email: EmailConfig,
    /// Bearer token for the operator routes; unset disables them
    pub admin_api_key: Option<String>,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_non_empty(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}

/// `FRONTEND_URL`, the development origins and any `ALLOWED_ORIGINS`, deduplicated
fn build_allowed_origins(frontend_url: &str, extra: Option<&str>) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    let candidates = std::iter::once(frontend_url)
        .chain(DEV_ORIGINS)
        .chain(extra.into_iter().flat_map(|s| s.split(',')));

    for origin in candidates {
        let origin = origin.trim().trim_end_matches('/');
        if !origin.is_empty() && !origins.iter().any(|o| o == origin) {
            origins.push(origin.to_string());
        }
    }
    origins
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = env_non_empty("BIND_ADDRESS")
            .or_else(|| env_non_empty("PORT").map(|port| format!("0.0.0.0:{}", port)))
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let frontend_url = env_non_empty("FRONTEND_URL")
            .ok_or(ConfigError::Missing("FRONTEND_URL"))?
            .trim_end_matches('/')
            .to_string();

        let allowed_origins =
            build_allowed_origins(&frontend_url, env_non_empty("ALLOWED_ORIGINS").as_deref());

        let notify_timeout_secs = match env_non_empty("NOTIFY_TIMEOUT_SECS") {
            None => DEFAULT_NOTIFY_TIMEOUT_SECS,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "NOTIFY_TIMEOUT_SECS",
                value: raw,
            })?,
        };

        Ok(Self {
            bind_address,
            database_url: env_non_empty("DATABASE_URL"),
            run_migrations: parse_bool("RUN_MIGRATIONS", true)?,
            frontend_url,
            allowed_origins,
            notify_timeout: Duration::from_secs(notify_timeout_secs),
            stripe: StripeConfig::from_env()?,
            email: EmailConfig::from_env(),
            admin_api_key: env_non_empty("ADMIN_API_KEY"),
        })
    }
}
