//! # Backfill Configuration System
//!
//! Typed, layered configuration for the worker process. Values come from, in increasing
//! precedence:
//!
//! 1. compiled-in defaults ([`BackfillConfig::default`])
//! 2. `config/backfill.toml`
//! 3. `config/backfill.{environment}.toml`
//! 4. environment variables prefixed `BACKFILL__`, with `__` separating sections
//!    (e.g. `BACKFILL__RUNNER__SETTINGS_POLL_INTERVAL_MS=500`)
//!
//! Per-run knobs (num_threads, batch sizes, backoff schedule) are not here; they live on the
//! run itself and are edited through the administrative surface.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use backfill_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let lease = manager.config().scheduler.lease_duration();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{leasing, runner, DEFAULT_BACKOFF_SCHEDULE_MS};
use crate::error::{BackfillError, Result};

pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/backfill.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Lease hunting and runner supervision
    pub scheduler: SchedulerConfig,

    /// Per-partition pipeline tuning
    pub runner: RunnerConfig,

    /// Database connection settings
    pub database: DatabaseConfig,

    /// Logging settings
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub hunt_interval_ms: u64,
    pub hunt_jitter_ms: u64,
    pub lease_duration_secs: u64,
    pub max_leases_per_hunt: usize,
    /// How long shutdown waits for runners to release their leases.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hunt_interval_ms: leasing::HUNT_INTERVAL.as_millis() as u64,
            hunt_jitter_ms: leasing::HUNT_JITTER.as_millis() as u64,
            lease_duration_secs: leasing::LEASE_DURATION.as_secs(),
            max_leases_per_hunt: leasing::MAX_LEASES_PER_HUNT,
            shutdown_timeout_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn hunt_interval(&self) -> Duration {
        Duration::from_millis(self.hunt_interval_ms)
    }

    pub fn hunt_jitter(&self) -> Duration {
        Duration::from_millis(self.hunt_jitter_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub settings_poll_interval_ms: u64,
    pub compute_time_limit_ms: u64,
    pub precompute_batch_limit: usize,
    pub batch_queue_thread_multiplier: usize,
    pub minimum_batches_per_call: usize,
    /// Used for runs that do not carry their own schedule.
    pub default_backoff_schedule_ms: Vec<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            settings_poll_interval_ms: runner::SETTINGS_POLL_INTERVAL.as_millis() as u64,
            compute_time_limit_ms: runner::COMPUTE_TIME_LIMIT.as_millis() as u64,
            precompute_batch_limit: runner::PRECOMPUTE_BATCH_LIMIT,
            batch_queue_thread_multiplier: runner::BATCH_QUEUE_THREAD_MULTIPLIER,
            minimum_batches_per_call: runner::MINIMUM_BATCHES_PER_CALL,
            default_backoff_schedule_ms: DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(),
        }
    }
}

impl RunnerConfig {
    pub fn settings_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings_poll_interval_ms)
    }

    pub fn compute_time_limit(&self) -> Duration {
        Duration::from_millis(self.compute_time_limit_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    /// Explicit URL, else `DATABASE_URL`.
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| {
            BackfillError::Configuration(
                "database.url is not set and DATABASE_URL is not in the environment".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl BackfillConfig {
    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 7] = [
            ("scheduler.hunt_interval_ms", self.scheduler.hunt_interval_ms > 0),
            (
                "scheduler.lease_duration_secs",
                self.scheduler.lease_duration_secs > 0,
            ),
            (
                "scheduler.max_leases_per_hunt",
                self.scheduler.max_leases_per_hunt > 0,
            ),
            (
                "runner.settings_poll_interval_ms",
                self.runner.settings_poll_interval_ms > 0,
            ),
            (
                "runner.batch_queue_thread_multiplier",
                self.runner.batch_queue_thread_multiplier > 0,
            ),
            (
                "runner.precompute_batch_limit",
                self.runner.precompute_batch_limit > 0,
            ),
            (
                "runner.default_backoff_schedule_ms",
                !self.runner.default_backoff_schedule_ms.is_empty(),
            ),
        ];

        for (field, ok) in checks {
            if !ok {
                return Err(BackfillError::Configuration(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        // The lease has to survive several settings polls or a healthy runner would lose it.
        if self.scheduler.lease_duration() <= self.runner.settings_poll_interval() * 2 {
            return Err(BackfillError::Configuration(format!(
                "scheduler.lease_duration_secs ({}s) must exceed twice the settings poll interval ({}ms)",
                self.scheduler.lease_duration_secs, self.runner.settings_poll_interval_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BackfillConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.lease_duration(), Duration::from_secs(300));
        assert_eq!(config.runner.settings_poll_interval(), Duration::from_secs(1));
        assert_eq!(
            config.runner.default_backoff_schedule_ms,
            vec![5_000, 15_000, 30_000]
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = BackfillConfig::default();
        config.runner.batch_queue_thread_multiplier = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_queue_thread_multiplier"));
    }

    #[test]
    fn test_lease_must_outlast_polls() {
        let mut config = BackfillConfig::default();
        config.scheduler.lease_duration_secs = 1;
        config.runner.settings_poll_interval_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_url_prefers_explicit_value() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost/backfill_test".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(
            config.database_url().unwrap(),
            "postgres://localhost/backfill_test"
        );
    }
}
