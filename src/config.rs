//! Configuration management for the gateway
//!
//! All settings come from environment variables with sensible defaults; the
//! only mandatory ones are the TimescaleDB connection parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server settings
    pub http: HttpConfig,

    /// TimescaleDB connection settings
    pub timescale: TimescaleConfig,

    /// Data retention in days; drives the retention policy and cache TTLs
    pub data_retention_days: u32,

    /// Tagset cache refresh interval in seconds
    pub tagset_cache_update_interval_seconds: u64,

    /// Tagset cache refresh timeout in seconds
    pub tagset_cache_update_timeout_seconds: u64,

    /// Housekeeping interval in seconds
    pub housekeeping_interval_seconds: u64,

    /// Housekeeping timeout in seconds
    pub housekeeping_timeout_seconds: u64,

    /// Capacity of the ingest metric-id cache
    pub insert_metric_cache_size: usize,

    /// Capacity of the ingest tagset-id cache
    pub insert_tagset_cache_size: usize,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
}

/// TimescaleDB connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimescaleConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Database name
    pub dbname: String,
    /// Connection pool size
    pub pool_size: u32,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Connection parameters (`TIMESCALE_*`) are required; everything else
    /// falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpConfig {
                host: env_or("HTTP_HOST", default_http_host())?,
                port: env_or("HTTP_PORT", default_http_port())?,
            },
            timescale: TimescaleConfig {
                host: required_env("TIMESCALE_HOST")?,
                port: env_or("TIMESCALE_PORT", 5432)?,
                user: required_env("TIMESCALE_USER")?,
                password: required_env("TIMESCALE_PASSWORD")?,
                dbname: required_env("TIMESCALE_DBNAME")?,
                pool_size: env_or("TIMESCALE_POOL_SIZE", default_pool_size())?,
            },
            data_retention_days: env_or("DATA_RETENTION_DAYS", default_retention_days())?,
            tagset_cache_update_interval_seconds: env_or(
                "TAGSET_CACHE_UPDATE_INTERVAL_SECONDS",
                default_tagset_interval(),
            )?,
            tagset_cache_update_timeout_seconds: env_or(
                "TAGSET_CACHE_UPDATE_TIMEOUT_SECONDS",
                default_tagset_timeout(),
            )?,
            housekeeping_interval_seconds: env_or(
                "HOUSEKEEPING_INTERVAL_SECONDS",
                default_housekeeping_interval(),
            )?,
            housekeeping_timeout_seconds: env_or(
                "HOUSEKEEPING_TIMEOUT_SECONDS",
                default_housekeeping_timeout(),
            )?,
            insert_metric_cache_size: env_or(
                "INSERT_METRIC_CACHE_SIZE",
                default_metric_cache_size(),
            )?,
            insert_tagset_cache_size: env_or(
                "INSERT_TAGSET_CACHE_SIZE",
                default_tagset_cache_size(),
            )?,
        })
    }

    /// The configured data retention window
    pub fn data_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.data_retention_days) * 24 * 60 * 60)
    }

    /// TTL for ingest id caches: half the retention window, so a cached id
    /// can never outlive its database row
    pub fn cache_entry_ttl(&self) -> Duration {
        self.data_retention() / 2
    }

    /// Refresh interval for the tagset cache
    pub fn tagset_cache_update_interval(&self) -> Duration {
        Duration::from_secs(self.tagset_cache_update_interval_seconds)
    }

    /// Timeout for one tagset cache refresh cycle
    pub fn tagset_cache_update_timeout(&self) -> Duration {
        Duration::from_secs(self.tagset_cache_update_timeout_seconds)
    }

    /// Interval between housekeeping cycles
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_seconds)
    }

    /// Timeout for one housekeeping cycle
    pub fn housekeeping_timeout(&self) -> Duration {
        Duration::from_secs(self.housekeeping_timeout_seconds)
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVariable(name.to_string()))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            variable: name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

// Default value functions
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    4242
}
fn default_pool_size() -> u32 {
    16
}
fn default_retention_days() -> u32 {
    30
}
fn default_tagset_interval() -> u64 {
    30
}
fn default_tagset_timeout() -> u64 {
    60
}
fn default_housekeeping_interval() -> u64 {
    3600
}
fn default_housekeeping_timeout() -> u64 {
    600
}
fn default_metric_cache_size() -> usize {
    65_536
}
fn default_tagset_cache_size() -> usize {
    2_097_152
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_ttl_is_half_retention() {
        let config = Config {
            http: HttpConfig {
                host: default_http_host(),
                port: default_http_port(),
            },
            timescale: TimescaleConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "tsgate".to_string(),
                password: String::new(),
                dbname: "tsgate".to_string(),
                pool_size: default_pool_size(),
            },
            data_retention_days: 30,
            tagset_cache_update_interval_seconds: default_tagset_interval(),
            tagset_cache_update_timeout_seconds: default_tagset_timeout(),
            housekeeping_interval_seconds: default_housekeeping_interval(),
            housekeeping_timeout_seconds: default_housekeeping_timeout(),
            insert_metric_cache_size: default_metric_cache_size(),
            insert_tagset_cache_size: default_tagset_cache_size(),
        };

        assert_eq!(config.cache_entry_ttl(), config.data_retention() / 2);
        assert!(config.cache_entry_ttl() < config.data_retention());
    }
}
