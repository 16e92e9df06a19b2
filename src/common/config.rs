//! Configuration for ringkv components

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordination store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Query client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Coordination store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// RocksDB directory for persistent nodes. In-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Query client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Attempts per query before giving up
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,

    /// Route a key to a host derived from its hash instead of the rotating cursor
    #[serde(default = "default_use_key_hash")]
    pub use_key_hash: bool,
}

fn default_max_tries() -> usize {
    3
}
fn default_use_key_hash() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            use_key_hash: default_use_key_hash(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            client: ClientConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `ringkv.toml` (optional) and `RINGKV_*` environment variables.
    pub fn load() -> crate::Result<Self> {
        Self::load_from("ringkv")
    }

    /// Load configuration from the given file stem, then the environment.
    pub fn load_from(file: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("RINGKV").separator("__"))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.client.max_tries == 0 {
            return Err(crate::Error::InvalidConfig(
                "client.max_tries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.client.max_tries, 3);
        assert!(config.client.use_key_hash);
        assert!(config.store.path.is_none());
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_tries_rejected() {
        let mut config = Config::default();
        config.client.max_tries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cluster.toml");
        std::fs::write(
            &file,
            "log_level = \"debug\"\n[client]\nmax_tries = 5\nuse_key_hash = false\n[store]\npath = \"/var/lib/ringkv\"\n",
        )
        .unwrap();

        let stem = dir.path().join("cluster");
        let config = Config::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.client.max_tries, 5);
        assert!(!config.client.use_key_hash);
        assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/ringkv")));
    }
}
