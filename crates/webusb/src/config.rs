//! Configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::DiscoveryOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbConfig {
    #[serde(default = "UsbConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Extra open attempts when a freshly attached device is still busy
    #[serde(default = "DiscoverySettings::default_open_retries")]
    pub open_retries: u32,
    /// Delay between open attempts
    #[serde(default = "DiscoverySettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Probe devices for a WebUSB landing page
    #[serde(default = "DiscoverySettings::default_fetch_landing_url")]
    pub fetch_landing_url: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            open_retries: Self::default_open_retries(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            fetch_landing_url: Self::default_fetch_landing_url(),
        }
    }
}

impl DiscoverySettings {
    fn default_open_retries() -> u32 {
        10
    }

    fn default_retry_delay_ms() -> u64 {
        200
    }

    fn default_fetch_landing_url() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Timeout applied to every host transfer, in milliseconds
    #[serde(default = "TransportSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Hide root hubs from enumeration
    #[serde(default = "TransportSettings::default_skip_root_hubs")]
    pub skip_root_hubs: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            skip_root_hubs: Self::default_skip_root_hubs(),
        }
    }
}

impl TransportSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    fn default_skip_root_hubs() -> bool {
        true
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            discovery: DiscoverySettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl UsbConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the specified path, or the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let p = Self::default_path();
                if !p.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                p
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: UsbConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("webusb").join("config.toml")
        } else {
            PathBuf::from(".config/webusb/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.transport.timeout_ms == 0 {
            return Err(anyhow!("transport.timeout_ms must be greater than zero"));
        }

        Ok(())
    }

    /// Install the tracing subscriber at the configured level
    ///
    /// `RUST_LOG` still takes precedence.
    pub fn init_logging(&self) -> common::Result<()> {
        common::setup_logging(&self.log_level)
    }

    /// Discovery options for [`crate::UsbOptions`]
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            open_retries: self.discovery.open_retries,
            retry_delay: Duration::from_millis(self.discovery.retry_delay_ms),
            fetch_landing_url: self.discovery.fetch_landing_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = UsbConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.discovery.open_retries, 10);
        assert_eq!(config.transport.timeout(), Duration::from_secs(5));
        assert!(config.transport.skip_root_hubs);
        assert_eq!(config.discovery_options(), DiscoveryOptions::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: UsbConfig = toml::from_str(
            r#"
            log_level = "debug"

            [discovery]
            open_retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.discovery.open_retries, 3);
        assert_eq!(config.discovery.retry_delay_ms, 200);
        assert!(config.discovery.fetch_landing_url);
        assert_eq!(config.transport, TransportSettings::default());
    }

    #[test]
    fn test_validate() {
        let mut config = UsbConfig::default();
        assert!(config.validate().is_ok());

        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.log_level = "warn".to_string();
        config.transport.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_logging_once() {
        let config = UsbConfig::default();
        let _ = config.init_logging();
        assert!(config.init_logging().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = UsbConfig::default();
        config.discovery.fetch_landing_url = false;
        config.transport.timeout_ms = 250;
        config.save(&path).unwrap();

        let loaded = UsbConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "log_level = \"verbose\"\n").unwrap();
        assert!(UsbConfig::load(Some(path.clone())).is_err());

        fs::write(&path, "log_level = [").unwrap();
        let err = UsbConfig::load(Some(path)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config file"));
    }
}
