use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::application::{EngineConfig, RetryPolicy};
use crate::collaborators::ArbiterRoster;
use crate::domain::{MatchPolicy, UserId, VerificationLevel};

const DEFAULT_CONFIG_PATH: &str = "mutua.toml";
const ENV_PREFIX: &str = "MUTUA";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub directory: DirectorySettings,
    pub engine: EngineSettings,
    pub matching: MatchingSettings,
    pub arbitration: ArbitrationSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "mutua.db".to_string(),
        }
    }
}

/// Where the command line finds member profiles (JSON array).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub path: String,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            path: "users.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub request_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub retry: RetrySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            request_timeout_secs: defaults.request_timeout.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub min_verification_level: VerificationLevel,
    pub max_concurrent_requests: u32,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        let defaults = MatchPolicy::default();
        Self {
            min_verification_level: defaults.min_verification_level,
            max_concurrent_requests: defaults.max_concurrent_requests,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbitrationSettings {
    pub arbiters: Vec<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `tracing-subscriber` filter directive, e.g. `info` or `mutua=debug`
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the config file (`mutua.toml` unless
    /// `path` is given), then `MUTUA__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("arbitration.arbiters")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        let retry = &self.engine.retry;
        EngineConfig {
            request_timeout: Duration::from_secs(self.engine.request_timeout_secs),
            sweep_interval: Duration::from_secs(self.engine.sweep_interval_secs),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                base_delay: Duration::from_millis(retry.base_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
            },
            matching: MatchPolicy {
                min_verification_level: self.matching.min_verification_level,
                max_concurrent_requests: self.matching.max_concurrent_requests,
            },
        }
    }

    pub fn arbiter_roster(&self) -> ArbiterRoster {
        ArbiterRoster::new(self.arbitration.arbiters.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let settings = Settings::default();
        let config = settings.engine_config();
        let defaults = EngineConfig::default();

        assert_eq!(config.request_timeout, defaults.request_timeout);
        assert_eq!(config.retry, defaults.retry);
        assert_eq!(config.matching, MatchPolicy::default());
        assert!(settings.arbiter_roster().is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutua.toml");
        let arbiter = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                r#"
                [database]
                path = "exchange.db"

                [engine]
                request_timeout_secs = 3600

                [matching]
                min_verification_level = "premium"

                [arbitration]
                arbiters = ["{}"]
                "#,
                arbiter
            ),
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.database.path, "exchange.db");
        assert_eq!(settings.log.level, "info");

        let config = settings.engine_config();
        assert_eq!(config.request_timeout, Duration::from_secs(3600));
        assert_eq!(config.matching.min_verification_level, VerificationLevel::Premium);
        assert_eq!(config.matching.max_concurrent_requests, 3);
        assert_eq!(settings.arbiter_roster().len(), 1);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Settings::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
