//! Configuration management for the relay.
//!
//! Loaded from a TOML file with `[relay]` and `[logging]` sections; command
//! line flags override individual values after loading.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network settings for the relay listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Address to listen on (e.g., "127.0.0.1:9050")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Shared secret clients must send before anything else
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1:9050".to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            auth_token: None,
        }
    }
}

impl RelaySettings {
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        self.bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_address))
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the defaults to `path` and returns
    /// them.
    pub async fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks the configuration for consistency.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.relay.bind_address
            ));
        }

        if matches!(&self.relay.auth_token, Some(token) if token.is_empty()) {
            return Err("Auth token cannot be empty; omit it to disable auth".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.relay.bind_address, "127.0.0.1:9050");
        assert!(config.relay.auth_token.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.relay.bind_address, "127.0.0.1:9050");
        assert!(path.exists());

        // The written file loads back to the same values.
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.relay.bind_address, config.relay.bind_address);
        assert_eq!(reloaded.logging.level, config.logging.level);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        tokio::fs::write(
            &path,
            r#"
[relay]
bind_address = "0.0.0.0:7000"
auth_token = "hunter2"

[logging]
level = "debug"
json_format = true
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.relay.bind_address, "0.0.0.0:7000");
        assert_eq!(config.relay.auth_token.as_deref(), Some("hunter2"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(
            config.relay.bind_address().unwrap(),
            "0.0.0.0:7000".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        tokio::fs::write(&path, "[logging]\nlevel = \"warn\"\n")
            .await
            .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.relay.bind_address, "127.0.0.1:9050");
        assert_eq!(config.logging.level, "warn");
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        tokio::fs::write(&path, "[relay\nbind_address = ").await.unwrap();
        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.relay.bind_address = "not-an-address".to_string();
        assert!(config.validate().unwrap_err().contains("bind address"));

        let mut config = AppConfig::default();
        config.relay.auth_token = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("log level"));
    }
}
