//! Application configuration.

use serde::{Deserialize, Serialize};
use slotwatch_engine::SchedulerConfig;
use slotwatch_feeds::{CacheConfig, RateLimitConfig, SourceConfig};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Application configuration.
///
/// Every section is optional in the file; missing values take their
/// defaults. Secrets never live here: the bot token comes from the
/// environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database URL, overridden by `DATABASE_URL`.
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
    pub cache: CacheConfig,
    /// Per-credential request budget.
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://slotwatch.db".to_string(),
            scheduler: SchedulerConfig::default(),
            source: SourceConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: display,
                    source,
                })
            }
        };

        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Apply overrides from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database_url = url;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database_url, "sqlite://slotwatch.db");
        assert_eq!(config.scheduler.tick_interval_ms, 1_000);
        assert_eq!(config.cache.ttl_secs, 45);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "database_url": "sqlite::memory:",
                "scheduler": { "max_concurrent_polls": 8 },
                "rate_limit": { "max_requests": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.scheduler.max_concurrent_polls, 8);
        assert_eq!(config.scheduler.tick_interval_ms, 1_000);
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.window_ms, RateLimitConfig::default().window_ms);
        assert_eq!(config.source, SourceConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AppConfig::load("/nonexistent/slotwatch/config.json").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(AppConfig::from_json("{ \"scheduler\": 5 }").is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(AppConfig::from_json(&json).unwrap(), config);
    }
}
