//! # Rendezvous Server
//!
//! WebSocket presence and matchmaking relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! rendezvous
//!
//! # Run with environment variables
//! RENDEZVOUS_PORT=8080 RENDEZVOUS_HOST=0.0.0.0 rendezvous
//!
//! # Connect
//! websocat "ws://127.0.0.1:8080/ws?token=alice&channel=lobby"
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rendezvous=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        audience = ?config.registry.audience,
        dispatch = ?config.dispatch.mode,
        evict_on_reconnect = config.registry.evict_on_reconnect,
        "Starting Rendezvous server on {}:{}",
        config.host,
        config.port
    );

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await?;

    Ok(())
}
