//! # Structured Logging Module
//!
//! Environment-aware structured logging for the scheduler and its runners. Console output is
//! human readable by default and switches to JSON lines when `telemetry.json_logs` is set.

use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::TelemetryConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging(telemetry: &TelemetryConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment, telemetry)));

        let layer = if telemetry.json_logs {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host process may already own the global subscriber.
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = telemetry.json_logs,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("BACKFILL_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Configured level, except that development and test always get debug.
fn get_log_level(environment: &str, telemetry: &TelemetryConfig) -> String {
    match environment {
        "test" | "development" => "debug".to_string(),
        _ => telemetry.log_level.clone(),
    }
}

/// Log a partition state transition
pub fn log_partition_operation(
    operation: &str,
    backfill_run_id: Uuid,
    partition_name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        backfill_run_id = %backfill_run_id,
        partition = %partition_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 PARTITION_OPERATION"
    );
}

/// Log a lease acquisition, loss or release
pub fn log_lease_operation(operation: &str, partition_id: Uuid, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        partition_id = %partition_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔒 LEASE_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        let telemetry = TelemetryConfig {
            log_level: "warn".to_string(),
            json_logs: false,
        };
        assert_eq!(get_log_level("test", &telemetry), "debug");
        assert_eq!(get_log_level("development", &telemetry), "debug");
        assert_eq!(get_log_level("production", &telemetry), "warn");
    }

    #[test]
    fn test_init_is_idempotent() {
        let telemetry = TelemetryConfig::default();
        init_structured_logging(&telemetry);
        init_structured_logging(&telemetry);
    }
}
