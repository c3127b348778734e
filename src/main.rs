//! Tick ingestion pipeline entrypoint: loads configuration, starts the
//! Supervisor, and runs until a shutdown signal is received.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tickstream::config::ServiceConfig;
use tickstream::persistence::LoggingWriter;
use tickstream::telemetry::{Logger, Telemetry};
use tickstream::Supervisor;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let logger = Arc::new(Logger::new(1000));
    init_tracing(logger.clone());

    let config = ServiceConfig::from_env();
    info!(symbols = ?config.symbols, "starting tick ingestion pipeline");

    let telemetry = Arc::new(Telemetry::with_logger(logger));
    let supervisor = Supervisor::with_writer_and_telemetry(config, Arc::new(LoggingWriter), telemetry);
    supervisor
        .start()
        .await
        .context("supervisor failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received");
    supervisor
        .stop(Duration::from_secs(10))
        .await
        .context("supervisor did not shut down cleanly")?;

    Ok(())
}

fn init_tracing(logger: Arc<Logger>) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logger)
        .init();
}
