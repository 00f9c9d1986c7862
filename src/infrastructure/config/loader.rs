//! Configuration loader with hierarchical merging.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent: {0}. Must be between 1 and 100")]
    InvalidMaxConcurrent(usize),

    #[error("Invalid poll_interval_secs: {0}. Must be at least 1")]
    InvalidPollInterval(u64),

    #[error("Invalid heartbeat_ttl_secs: {0}. Must be at least 1")]
    InvalidHeartbeatTtl(u64),

    #[error("Invalid lease ttl_secs: {0}. Must be at least 1")]
    InvalidLeaseTtl(u64),

    #[error("Invalid max_renewals: {0}. Cannot be 0")]
    InvalidMaxRenewals(u32),

    #[error("Invalid spawn_timeout_ms: {0}. Must be at least 1")]
    InvalidSpawnTimeout(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Loads the runtime configuration for one data directory.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. `<data-dir>/config.yaml` (per-deployment config)
    /// 3. Environment variables (`FOREMAN_*` prefix, highest priority)
    ///
    /// Configuration is always data-dir-local so multiple schedulers
    /// on one machine stay independent.
    pub fn load(data_dir: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(data_dir.join("config.yaml")))
            .merge(Env::prefixed("FOREMAN_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.scheduler.max_concurrent == 0 || config.scheduler.max_concurrent > 100 {
            return Err(ConfigError::InvalidMaxConcurrent(
                config.scheduler.max_concurrent,
            ));
        }
        if config.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval(
                config.scheduler.poll_interval_secs,
            ));
        }
        if config.scheduler.heartbeat_ttl_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatTtl(
                config.scheduler.heartbeat_ttl_secs,
            ));
        }
        if config.lease.ttl_secs == 0 {
            return Err(ConfigError::InvalidLeaseTtl(config.lease.ttl_secs));
        }
        if config.lease.max_renewals == 0 {
            return Err(ConfigError::InvalidMaxRenewals(config.lease.max_renewals));
        }
        if config.executor.spawn_timeout_ms == 0 {
            return Err(ConfigError::InvalidSpawnTimeout(
                config.executor.spawn_timeout_ms,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
