//! Configuration (ambient): a single TOML file, the same
//! read-to-string-then-`toml::from_str` shape metricdog's config module uses
//! rather than a layered config-sources crate, since no file in this pack
//! pulls in one of those.

use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/agentcore.toml";

fn default_state_store_path() -> PathBuf {
    PathBuf::from("/var/lib/agentcore/store")
}

fn default_deployment_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/agentcore/logs")
}

fn default_update_poll_seconds() -> u64 {
    300
}

fn default_inventory_poll_seconds() -> u64 {
    3600
}

fn default_retry_poll_seconds() -> u64 {
    60
}

/// Deserialized shape of `agentcore.toml`. Durations are stored as seconds on
/// disk and converted once at load time, since `std::time::Duration` itself
/// has no TOML representation.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server_url: String,

    #[serde(default = "default_update_poll_seconds")]
    pub update_poll_interval_secs: u64,

    #[serde(default = "default_inventory_poll_seconds")]
    pub inventory_poll_interval_secs: u64,

    #[serde(default = "default_retry_poll_seconds")]
    pub retry_poll_interval_secs: u64,

    #[serde(default = "default_state_store_path")]
    pub state_store_path: PathBuf,

    #[serde(default = "default_deployment_log_dir")]
    pub deployment_log_dir: PathBuf,
}

impl Config {
    pub fn new() -> Result<Self> {
        Self::from_file(PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(error::ConfigReadSnafu { path })?;
        let config: Config = toml::from_str(&contents).context(error::ConfigParseSnafu { path })?;
        Ok(config)
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_poll_interval_secs)
    }

    pub fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_poll_interval_secs)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STANDARD_CONFIG: &str = r#"
    server_url = "https://updates.example.com"
    update_poll_interval_secs = 300
    inventory_poll_interval_secs = 3600
    retry_poll_interval_secs = 60
    state_store_path = "/var/lib/agentcore/store"
    deployment_log_dir = "/var/lib/agentcore/logs"
    "#;

    #[test]
    fn standard_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentcore.toml");
        std::fs::write(&path, STANDARD_CONFIG).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server_url, "https://updates.example.com");
        assert_eq!(config.update_poll_interval(), Duration::from_secs(300));
        assert_eq!(config.inventory_poll_interval(), Duration::from_secs(3600));
        assert_eq!(config.retry_poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentcore.toml");
        std::fs::write(&path, r#"server_url = "https://updates.example.com""#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.update_poll_interval(), Duration::from_secs(300));
        assert_eq!(config.retry_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.state_store_path, default_state_store_path());
    }

    #[test]
    fn missing_file_is_a_config_read_error() {
        let err = Config::from_file("/nonexistent/agentcore.toml").unwrap_err();
        assert!(matches!(err, error::Error::ConfigRead { .. }));
    }

    #[test]
    fn malformed_toml_is_a_config_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentcore.toml");
        std::fs::write(&path, "this is not valid toml [[[").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, error::Error::ConfigParse { .. }));
    }
}
