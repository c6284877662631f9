//! Configuration Loader
//!
//! Environment-aware loading: compiled defaults, then `backfill.toml`, then
//! `backfill.{env}.toml`, then `BACKFILL__*` environment variables.

use config::{Config, Environment, File, FileFormat, Map};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::BackfillConfig;
use crate::constants::system::CONFIG_ENV_PREFIX;
use crate::error::Result;

const BASE_FILE_NAME: &str = "backfill";

pub struct ConfigManager {
    config: BackfillConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(Self::default_config_directory(), &environment)
    }

    /// Load from an explicit directory and environment name
    pub fn load_from_directory_with_env(
        config_directory: PathBuf,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_directory, environment, None)
    }

    /// Same as [`Self::load_from_directory_with_env`] but reads overrides from `vars` instead
    /// of the process environment. Keys keep their `BACKFILL__` prefix.
    pub fn load_with_overrides(
        config_directory: PathBuf,
        environment: &str,
        vars: Map<String, String>,
    ) -> Result<Arc<ConfigManager>> {
        Self::build(config_directory, environment, Some(vars))
    }

    fn build(
        config_directory: PathBuf,
        environment: &str,
        vars: Option<Map<String, String>>,
    ) -> Result<Arc<ConfigManager>> {
        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading backfill configuration"
        );

        let base_file = config_directory.join(format!("{BASE_FILE_NAME}.toml"));
        let env_file = config_directory.join(format!("{BASE_FILE_NAME}.{environment}.toml"));
        if !base_file.exists() {
            debug!(path = %base_file.display(), "No base config file, using defaults");
        }

        let environment_source = Environment::with_prefix(CONFIG_ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("runner.default_backoff_schedule_ms")
            .source(vars);

        let config: BackfillConfig = Config::builder()
            .add_source(Config::try_from(&BackfillConfig::default())?)
            .add_source(File::from(base_file).format(FileFormat::Toml).required(false))
            .add_source(File::from(env_file).format(FileFormat::Toml).required(false))
            .add_source(environment_source)
            .build()?
            .try_deserialize()?;

        config.validate()?;

        info!(
            environment = %environment,
            lease_duration_secs = config.scheduler.lease_duration_secs,
            max_leases_per_hunt = config.scheduler.max_leases_per_hunt,
            json_logs = config.telemetry.json_logs,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// BACKFILL_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("BACKFILL_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("BACKFILL_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}

static GLOBAL_CONFIG: OnceLock<Arc<ConfigManager>> = OnceLock::new();

impl ConfigManager {
    /// Get or initialize the global configuration instance.
    ///
    /// Falls back to defaults when loading fails so the worker can still report the problem.
    pub fn global() -> Arc<ConfigManager> {
        GLOBAL_CONFIG
            .get_or_init(|| {
                ConfigManager::load().unwrap_or_else(|e| {
                    warn!(error = %e, "Configuration loading failed, using defaults");
                    Arc::new(ConfigManager {
                        config: BackfillConfig::default(),
                        environment: Self::detect_environment(),
                        config_directory: Self::default_config_directory(),
                    })
                })
            })
            .clone()
    }
}
