//! Monitor configuration, read from the environment.
//!
//! A `.env` file in the working directory is loaded first when present.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::DEFAULT_EVENT_LOG_CAPACITY;
use crate::runtime::orchestrator::DEFAULT_REMOVAL_GRACE;
use crate::stream::connection::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE};
use crate::stream::ReconnectPolicy;

pub const ENV_API_URL: &str = "TRAINING_API_URL";
pub const ENV_API_TOKEN: &str = "TRAINING_API_TOKEN";
pub const ENV_DATA_DIR: &str = "TRAINING_DATA_DIR";
pub const ENV_RECONNECT_BASE_MS: &str = "TRAINING_RECONNECT_BASE_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "TRAINING_MAX_RECONNECT_ATTEMPTS";
pub const ENV_REMOVAL_GRACE_MS: &str = "TRAINING_REMOVAL_GRACE_MS";
pub const ENV_EVENT_LOG_CAPACITY: &str = "TRAINING_EVENT_LOG_CAPACITY";

const DB_FILE_NAME: &str = "training.db";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub api_url: String,
    pub api_token: String,
    pub data_dir: PathBuf,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub removal_grace_ms: u64,
    pub event_log_capacity: usize,
}

impl MonitorConfig {
    /// Defaults for everything except the endpoint and its token.
    pub fn new(api_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_token: api_token.into(),
            data_dir: default_data_dir(),
            reconnect_base_ms: DEFAULT_RECONNECT_BASE.as_millis() as u64,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            removal_grace_ms: DEFAULT_REMOVAL_GRACE.as_millis() as u64,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        }
    }

    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_url = get(ENV_API_URL).ok_or(ConfigError::Missing(ENV_API_URL))?;
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: ENV_API_URL,
                value: api_url,
            });
        }
        let api_token = get(ENV_API_TOKEN).ok_or(ConfigError::Missing(ENV_API_TOKEN))?;

        let mut config = Self::new(api_url, api_token);
        if let Some(dir) = get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get(ENV_RECONNECT_BASE_MS) {
            config.reconnect_base_ms = parse(ENV_RECONNECT_BASE_MS, raw)?;
        }
        if let Some(raw) = get(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.max_reconnect_attempts = parse(ENV_MAX_RECONNECT_ATTEMPTS, raw)?;
        }
        if let Some(raw) = get(ENV_REMOVAL_GRACE_MS) {
            config.removal_grace_ms = parse(ENV_REMOVAL_GRACE_MS, raw)?;
        }
        if let Some(raw) = get(ENV_EVENT_LOG_CAPACITY) {
            let capacity: usize = parse(ENV_EVENT_LOG_CAPACITY, raw.clone())?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    name: ENV_EVENT_LOG_CAPACITY,
                    value: raw,
                });
            }
            config.event_log_capacity = capacity;
        }
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

fn parse<T: FromStr>(name: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw })
}

fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".training-stream");
    }

    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".training-stream");
    }

    PathBuf::from(".training-stream")
}
