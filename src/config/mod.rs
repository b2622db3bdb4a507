//! Configuration management for azauth

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Azure SQL resource every interactive token is requested for
pub const DATABASE_SCOPE: &str = "https://database.windows.net/.default";
/// Needed so the provider hands out a refresh token
pub const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub azure: AzureConfig,
    pub polling: PollingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Base URL of the cloud token broker
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.beekeeperstudio.io".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Public client application id registered with Entra ID; must be set before login
    pub client_id: String,
    /// Authority the authorize/token endpoints hang off
    pub authority: String,
    pub scopes: Vec<String>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            authority: "https://login.microsoftonline.com/organizations".to_string(),
            scopes: vec![DATABASE_SCOPE.to_string(), OFFLINE_ACCESS_SCOPE.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Pause between two broker status reads
    pub interval_ms: u64,
    /// Wall-clock budget for the user to finish signing in (default: 5 minutes)
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            timeout_ms: 300_000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding encrypted token caches
    pub database_path: Option<PathBuf>,
    /// File holding the field encryption key material
    pub key_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::data_dir()?.join("token_cache.db")),
        }
    }

    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.key_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::data_dir()?.join("encryption.key")),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, falling back to defaults if absent
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "azure-broker-auth") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Directory for the token cache database and key file
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .context("Failed to determine data directory")?;

        Ok(data_dir.join("azure-broker-auth"))
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_azure_sql() {
        let config = Config::default();
        assert_eq!(config.polling.interval(), Duration::from_secs(2));
        assert_eq!(
            config.azure.scopes,
            vec![DATABASE_SCOPE.to_string(), OFFLINE_ACCESS_SCOPE.to_string()]
        );
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [polling]
            timeout_ms = 5000

            [broker]
            base_url = "http://127.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.polling.timeout_ms, 5000);
        assert_eq!(config.polling.interval_ms, 2000);
        assert_eq!(config.broker.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.broker.request_timeout_secs, 30);
    }

    #[test]
    fn load_from_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.polling.timeout_ms, 300_000);
    }
}
