//! Broker Pool Relay - Main Entry Point
//!
//! Accepts messages over HTTP and publishes them to the configured brokers.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brokerpool::api::{self, handlers::AppState};
use brokerpool::transport;
use brokerpool::{MessagingConfig, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "brokerpool=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = match std::env::var("BROKER_CONFIG") {
        Ok(path) => MessagingConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => MessagingConfig::from_env().context("reading BROKER_* environment")?,
    };
    config.validate()?;

    info!("Starting Broker Pool Relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        endpoints = config.endpoints.len(),
        selection = ?config.selection,
        transport = ?config.transport,
        "Broker configuration loaded"
    );

    // Initialize components
    let transport = transport::from_kind(config.transport);
    let publisher = Arc::new(Publisher::new(&config, transport)?);

    let state = Arc::new(AppState {
        publisher: publisher.clone(),
    });

    // Build HTTP routes
    let app = api::router(state);

    // Start server
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3017);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush partial transaction batches before exiting
    publisher.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
