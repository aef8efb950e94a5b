mod api;
mod app;
mod auth;
mod config;
mod db;
mod domain;
mod error;
mod logging;
mod middleware;
mod routes;
mod services;

use anyhow::Result;
use std::sync::Arc;

use services::broadcast::{Broadcaster, LogBroadcaster};
use services::cache::RedisCache;
use services::notifications::{Notifier, OutboxNotifier};
use services::payments::{MockPaymentGateway, PaymentClient, PaymentGateway};
use services::vendor::{MockVendor, VendorApi, VendorClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting ridebroker backend"
    );

    // Create database pool
    let pool = db::create_pool(&settings).await?;

    // Create Redis cache
    let cache = RedisCache::new(&settings.redis_url, settings.redis_cache_ttl_seconds).await?;
    tracing::info!("Redis cache initialized");

    // Vendor dispatch network client (or the built-in mock)
    let vendor: Arc<dyn VendorApi> = if settings.vendor_mock_mode {
        tracing::warn!("VENDOR_MOCK_MODE is on, vendor calls are served by the mock");
        Arc::new(MockVendor)
    } else {
        Arc::new(VendorClient::new(
            &settings.vendor_api_url,
            &settings.vendor_agent_id,
            &settings.vendor_agent_password,
            settings.vendor_timeout_seconds,
        )?)
    };

    // Payment gateway (dev environments get the always-approving mock)
    let payments: Arc<dyn PaymentGateway> = if settings.env.is_dev() {
        Arc::new(MockPaymentGateway)
    } else {
        Arc::new(PaymentClient::new(
            &settings.payment_service_url,
            &settings.payment_service_token,
            settings.payment_timeout_seconds,
        )?)
    };

    let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(pool.clone()));
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(LogBroadcaster);

    // Create JWKS cache for JWT verification
    let jwks_cache = auth::JwksCache::new(
        settings.auth_jwks_url.clone(),
        settings.auth_jwt_issuer.clone(),
        settings.auth_jwt_audience.clone(),
        settings.jwks_cache_ttl_seconds,
    );

    // Optionally warm the JWKS cache
    if let Err(e) = jwks_cache.warm_cache().await {
        tracing::warn!(error = %e, "Failed to warm JWKS cache - will fetch on first request");
    }

    // Create application state
    let state = app::AppState::new(
        pool,
        settings.clone(),
        jwks_cache,
        cache,
        vendor,
        payments,
        notifier,
        broadcaster,
    );

    // Build application
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
