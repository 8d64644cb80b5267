mod avatar;
mod config;
mod contact;
mod error;
mod gateway;
mod model;
mod normalize;
mod server;
mod service;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::client::GatewayClient;
use crate::server::AppState;
use crate::service::Adapter;
use crate::sync::TokioSleeper;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,salesview=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let summary = config.gateway.summary();
    info!("Configuration loaded successfully");
    info!("  Gateway configured: {}", summary.configured);
    info!("  Gateway timeout: {}ms", config.gateway.timeout_ms);
    info!(
        "  Sync: {} attempts, {}s apart",
        config.sync.max_attempts, config.sync.retry_delay_secs
    );
    if let Err(e) = config.gateway.credentials() {
        warn!("{}", e.hint());
    }
    if let Some(warning) = &summary.warning {
        warn!("{}", warning);
    }

    let bind = config.server.bind.clone();
    let gateway = Arc::new(GatewayClient::new(&config.gateway));
    let adapter = Adapter::new(gateway, Arc::new(TokioSleeper), config);
    let state = Arc::new(AppState { adapter });

    info!("Gateway adapter is starting...");
    server::serve(state, &bind).await?;

    Ok(())
}
