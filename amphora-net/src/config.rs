//! Reconciler configuration.
//!
//! Loaded from a JSON file; every section and field falls back to its
//! default when omitted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub networking: NetworkingConfig,
    pub controller: ControllerConfig,
    pub database: DatabaseConfig,
}

/// Retry and polling budget for network-mutating steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    pub max_retries: u32,
    /// Multiplier of the exponential backoff, in seconds.
    pub retry_backoff: f64,
    /// Minimum wait between attempts and the admin-down poll interval.
    pub retry_interval_secs: u64,
    pub retry_max_secs: u64,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            max_retries: 15,
            retry_backoff: 1.0,
            retry_interval_secs: 1,
            retry_max_secs: 10,
        }
    }
}

impl NetworkingConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Management networks used when the availability zone names none.
    pub amp_boot_network_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}

impl Config {
    /// Load the configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.networking.max_retries, 15);
        assert_eq!(config.networking.retry_backoff, 1.0);
        assert_eq!(config.networking.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.networking.retry_max(), Duration::from_secs(10));
        assert!(config.controller.amp_boot_network_list.is_empty());
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"networking": {{"max_retries": 3}}, "controller": {{"amp_boot_network_list": ["mgmt"]}}}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.networking.max_retries, 3);
        assert_eq!(config.networking.retry_max_secs, 10);
        assert_eq!(config.controller.amp_boot_network_list, vec!["mgmt"]);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[tokio::test]
    async fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::load(&missing).await, Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(Config::load(&bad).await, Err(ConfigError::Parse { .. })));
    }
}
