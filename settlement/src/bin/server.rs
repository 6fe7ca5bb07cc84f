//! COD settlement service binary

use anyhow::Context;
use message_bus::LogDispatcher;
use settlement::{Config, SettlementEngine};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(service = %config.service_name, "Starting COD settlement service");

    let engine = SettlementEngine::open(config)
        .await
        .context("Failed to open settlement engine")?;
    let relay = engine.spawn_relay(Arc::new(LogDispatcher));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down COD settlement service");
    relay.shutdown().await;
    engine.shutdown().await?;
    Ok(())
}
