//! # Pylon Server
//!
//! Connection gateway for authenticated realtime clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! pylon
//!
//! # Run with environment variables
//! PYLON_PORT=8080 PYLON_HOST=0.0.0.0 pylon
//! ```
//!
//! Configuration is read from `pylon.toml` in the working directory,
//! `/etc/pylon/pylon.toml`, or `~/.config/pylon/pylon.toml`.

mod auth;
mod config;
mod gateway;
mod handlers;
mod metrics;

use anyhow::Result;
use pylon_core::{CircuitBreaker, ConnectionManager, MemoryStore, NoopValidator, RateLimiter};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pylon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Pylon gateway on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Shared store and its circuit breaker. The in-process store is the
    // single-node backend; pointing several gateways at one store means
    // implementing SharedStore over that service.
    let store = Arc::new(MemoryStore::new());
    let store_breaker = Arc::new(CircuitBreaker::new(
        "shared-store",
        config.breaker.store.to_breaker_config(),
    ));
    let limiter = RateLimiter::new(store, store_breaker, config.limiter_config());

    let identity_breaker = CircuitBreaker::new(
        "identity-provider",
        config.breaker.identity.to_breaker_config(),
    );

    let manager = Arc::new(ConnectionManager::new());
    let router = handlers::routes(manager.clone())?.build(Arc::new(NoopValidator));
    let message_quota = config.limits.messages.to_quota();

    let state = Arc::new(gateway::AppState {
        config,
        router,
        manager,
        limiter,
        identity_provider: Arc::new(auth::DevIdentityProvider),
        identity_breaker,
        message_quota,
    });

    // Start the server
    gateway::run_server(state).await?;

    Ok(())
}
