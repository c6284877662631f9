//! # Backfill Worker
//!
//! Worker process: loads configuration, connects to PostgreSQL and runs the lease-hunting
//! scheduler until Ctrl-C. Connectors are registered by embedders that build their own binary
//! around [`ConnectorRegistry`]; this one starts with an empty registry and only picks up runs
//! whose connector is registered.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use backfill_core::config::ConfigManager;
use backfill_core::logging::init_structured_logging;
use backfill_core::registry::ConnectorRegistry;
use backfill_core::scheduler::RunnerScheduler;
use backfill_core::stop::StopSignal;
use backfill_core::store::PgBackfillStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(&config.telemetry);

    info!(
        environment = %manager.environment(),
        config_directory = %manager.config_directory().display(),
        "🚀 WORKER: Starting backfill worker"
    );

    let url = config.database.database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&url)
        .await
        .context("connecting to PostgreSQL")?;

    let store = Arc::new(PgBackfillStore::new(pool));
    let registry = Arc::new(ConnectorRegistry::new());
    let scheduler = RunnerScheduler::from_config(store, registry, config);

    let shutdown = StopSignal::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        trigger.stop();
    });

    scheduler.run_until_stopped(shutdown).await?;
    info!("WORKER: Stopped");
    Ok(())
}
