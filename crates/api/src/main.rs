//! Sprouttie API Server
//!
//! Receives Stripe webhooks and keeps each user's plan in step with them.

use sprouttie_api::{create_app, AppState, Config};
use sprouttie_billing::{BillingDeps, BillingEmailService, BillingService, StripeClient};
use sprouttie_shared::{create_migration_pool, create_pool, run_migrations};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sprouttie_api=debug,sprouttie_billing=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting Sprouttie API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(
        frontend_url = %config.frontend_url,
        prices = ?config.stripe.price_ids.masked(),
        "Configuration loaded"
    );

    let stripe = StripeClient::new(config.stripe.clone());
    let email = BillingEmailService::new(config.email.clone());
    if !email.is_enabled() {
        tracing::warn!("RESEND_API_KEY not set, plan activation emails are disabled");
    }

    let deps = match config.database_url.as_deref() {
        Some(database_url) => {
            if config.run_migrations {
                let migration_pool = create_migration_pool(database_url).await?;
                run_migrations(&migration_pool).await?;
                migration_pool.close().await;
            }

            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            tracing::info!("Database connection established");
            BillingDeps::postgres(pool, stripe, email)
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, using in-memory stores; processed events and plans are lost on restart"
            );
            BillingDeps::in_memory(Arc::new(stripe), Arc::new(email))
        }
    };

    let billing = BillingService::new(
        &config.stripe,
        &config.frontend_url,
        config.notify_timeout,
        deps,
    );

    let addr = config.bind_address.clone();
    let app = create_app(AppState::new(config, billing));

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
