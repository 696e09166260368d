//! Configuration management for the secure-session core.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "session.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "SESSION_CORE";

/// Complete configuration for the secure-session core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cryptographic configuration
    pub crypto: CryptoConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cryptographic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Maximum number of message keys derived ahead for one incoming message
    pub max_skip: u32,
    /// Number of one-time prekeys generated per batch
    pub prekey_count: usize,
    /// Replenish one-time prekeys when fewer than this remain unpublished
    pub min_one_time_prekeys: usize,
    /// Maximum age for signed prekeys in seconds
    pub signed_prekey_max_age: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// File holding persisted conversation state and skipped message keys
    pub ratchet_store_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            max_skip: crate::defaults::DEFAULT_MAX_SKIP,
            prekey_count: crate::crypto::DEFAULT_PREKEY_COUNT,
            min_one_time_prekeys: crate::crypto::MIN_ONE_TIME_PREKEYS,
            signed_prekey_max_age: crate::crypto::SIGNED_PREKEY_MAX_AGE,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2p-secure-session");

        Self {
            ratchet_store_file: data_dir.join(crate::defaults::DEFAULT_RATCHET_STORE_FILE),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// # Arguments
    ///
    /// * `config_file` - Optional path to configuration file
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("p2p-secure-session")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.crypto = other.crypto;
        self.storage = other.storage;
        self.logging = other.logging;
        self
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        let max_skip_var = format!("{ENV_PREFIX}_CRYPTO_MAX_SKIP");
        if let Ok(max_skip) = std::env::var(&max_skip_var) {
            self.crypto.max_skip = max_skip.parse().map_err(|_| ConfigError::InvalidValue {
                field: max_skip_var.clone(),
                value: max_skip,
            })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            let data_dir = PathBuf::from(data_dir);
            self.storage.ratchet_store_file = data_dir.join(crate::defaults::DEFAULT_RATCHET_STORE_FILE);
            self.storage.data_dir = data_dir;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.crypto.max_skip == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crypto.max_skip".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.crypto.prekey_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crypto.prekey_count".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.crypto.min_one_time_prekeys > self.crypto.prekey_count {
            return Err(ConfigError::InvalidValue {
                field: "crypto.min_one_time_prekeys".to_string(),
                value: self.crypto.min_one_time_prekeys.to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure the data directory and the ratchet store's parent exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![self.storage.data_dir.clone()];
        if let Some(parent) = self.storage.ratchet_store_file.parent() {
            dirs_to_create.push(parent.to_path_buf());
        }

        for dir in &dirs_to_create {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crypto.max_skip, crate::defaults::DEFAULT_MAX_SKIP);
        assert!(config
            .storage
            .ratchet_store_file
            .starts_with(&config.storage.data_dir));
    }

    #[test]
    fn test_config_serialization() {
        let config = SessionConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("max_skip"));
        assert!(toml_str.contains("ratchet_store_file"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = SessionConfig::default();
        config.crypto.max_skip = 64;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = SessionConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.crypto.max_skip, 64);
        assert_eq!(loaded.crypto.prekey_count, config.crypto.prekey_count);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SessionConfig::default();
        assert!(config.validate().is_ok());

        config.crypto.max_skip = 0;
        assert!(config.validate().is_err());

        config = SessionConfig::default();
        config.crypto.prekey_count = 0;
        assert!(config.validate().is_err());

        config = SessionConfig::default();
        config.crypto.min_one_time_prekeys = config.crypto.prekey_count + 1;
        assert!(config.validate().is_err());

        config = SessionConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(SessionConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SESSION_CORE_CRYPTO_MAX_SKIP", "77");
        let config = SessionConfig::default().merge_from_env().unwrap();
        std::env::remove_var("SESSION_CORE_CRYPTO_MAX_SKIP");

        assert_eq!(config.crypto.max_skip, 77);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = TempDir::new().unwrap();
        let mut config = SessionConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.storage.ratchet_store_file = dir.path().join("data/state/ratchet.bin");

        config.ensure_directories().unwrap();
        assert!(dir.path().join("data/state").is_dir());
    }
}
