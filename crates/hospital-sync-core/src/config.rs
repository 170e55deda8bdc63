//! Sync configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreLocation;
use crate::sync::{ChannelSettings, RetryPolicy};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub delay_secs: u64,
    /// Omit to retry forever.
    pub max_attempts: Option<u32>,
    pub exponential: bool,
    pub max_delay_secs: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_attempts: None,
            exponential: false,
            max_delay_secs: 300,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.delay_secs);
        let mut policy = if self.exponential {
            RetryPolicy::exponential(delay, Duration::from_secs(self.max_delay_secs))
        } else {
            RetryPolicy::fixed(delay)
        };
        policy.max_attempts = self.max_attempts;
        policy.jitter = self.jitter;
        policy
    }
}

/// Platform data directory for role stores, e.g. `~/.local/share/hospital-sync`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("hospital-sync"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    /// Directory holding one store file per role. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Keep role stores in memory; nothing survives the process.
    pub in_memory: bool,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            data_dir: default_data_dir(),
            in_memory: false,
            pull_batch_size: 100,
            push_batch_size: 50,
            poll_interval_secs: 15,
            request_timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults with in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        if !self.in_memory && self.data_dir.is_none() {
            return Err(ConfigError::Invalid(
                "no platform data directory; set data_dir or in_memory".into(),
            ));
        }
        Ok(())
    }

    /// Where role stores live. Without a directory this falls back to memory,
    /// which [`validate`](Self::validate) only allows with `in_memory`.
    pub fn store_location(&self) -> StoreLocation {
        match &self.data_dir {
            Some(dir) if !self.in_memory => StoreLocation::Directory(dir.clone()),
            _ => StoreLocation::InMemory,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            pull_batch_size: self.pull_batch_size,
            push_batch_size: self.push_batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            request_timeout: self.request_timeout(),
            retry: self.retry.policy(),
        }
    }
}
