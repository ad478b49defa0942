use std::path::Path;

use serde::{Deserialize, Serialize};

use chatvault_core::error::VaultError;

/// User-Agent sent with every attachment fetch. Some CDNs refuse requests
/// without a browser-like identity.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/99.0.4844.51 Safari/537.36";

fn default_database_path() -> String {
    "./chatvault.db".into()
}
fn default_pool_size() -> usize {
    5
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pool_size: default_pool_size(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl VaultConfig {
    pub fn load(path: &Path) -> Result<Self, VaultError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: VaultConfig = serde_yaml::from_str(&content).map_err(|e| {
            VaultError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.pool_size == 0 {
            return Err(VaultError::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: VaultConfig = serde_yaml::from_str("database_path: /tmp/x.db").unwrap();
        assert_eq!(config.database_path, "/tmp/x.db");
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.download.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.download.timeout_secs, 60);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = VaultConfig {
            database_path: "history.db".into(),
            pool_size: 3,
            download: DownloadConfig {
                user_agent: "test-agent".into(),
                timeout_secs: 10,
            },
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: VaultConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_zero_pool_size_is_rejected() {
        let config: VaultConfig = serde_yaml::from_str("pool_size: 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_is_a_config_error() {
        let err = VaultConfig::load(Path::new("/nonexistent/chatvault.yaml")).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
