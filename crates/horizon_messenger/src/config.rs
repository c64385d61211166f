//! Messenger configuration.
//!
//! Loaded from TOML; every field has a default so a partial file works.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;
use crate::serializer::AllowList;

fn default_channel() -> String {
    "horizon:messenger".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9050
}

fn default_pool_size() -> usize {
    12
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

/// Settings consumed by the messaging core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Shared channel every messenger of the deployment subscribes to
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Fixed wait between a lost subscription and the next attempt
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Timeout used by `request` when none is given
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Payload type tags accepted from the channel
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default)]
    pub broker: BrokerSettings,
}

/// Where the broker lives and how many connections to pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret sent on connect, if the broker requires one
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl BrokerSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            allowed_types: Vec::new(),
            broker: BrokerSettings::default(),
        }
    }
}

impl MessengerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the defaults to it and returns them.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: MessengerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = MessengerConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default messenger configuration: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks the values the messenger cannot work without.
    pub fn validate(&self) -> Result<(), String> {
        if self.channel.trim().is_empty() {
            return Err("Channel name cannot be empty".to_string());
        }
        if self.reconnect_backoff_ms == 0 {
            return Err("reconnect_backoff_ms must be greater than zero".to_string());
        }
        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be greater than zero".to_string());
        }
        if self.broker.host.is_empty() {
            return Err("Broker host cannot be empty".to_string());
        }
        if self.broker.pool_size == 0 {
            return Err("Broker pool_size must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn allow_list(&self) -> AllowList {
        self.allowed_types.iter().cloned().collect()
    }
}
