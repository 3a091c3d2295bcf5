//! Service configuration
//!
//! Loaded from a TOML file (default `dam-cache.toml`). Every key has a
//! built-in default, so an empty file is a valid configuration.

mod defaults;

pub use defaults::DEFAULT_CONFIG_FILE;

use defaults::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// SQLite ledger file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory holding changeset trees
    #[serde(default = "default_changeset_path")]
    pub changeset_path: PathBuf,

    /// Mirror root scanned by `bulkmap`
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,

    /// File served by `transform_support`
    #[serde(default = "default_support_archive_path")]
    pub support_archive_path: PathBuf,

    /// Literal returned by `isCachingEnabled`
    #[serde(default = "default_caching_enabled")]
    pub caching_enabled: String,

    /// Raise the default log filter to `debug`
    #[serde(default)]
    pub debug_logging: bool,

    /// Changeset lock wait in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Upload limit in bytes (0 = unlimited)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_path: default_database_path(),
            changeset_path: default_changeset_path(),
            mirror_path: None,
            support_archive_path: default_support_archive_path(),
            caching_enabled: default_caching_enabled(),
            debug_logging: false,
            lock_timeout_secs: default_lock_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ServerConfig {
    /// Load configuration.
    ///
    /// With an explicit path the file must exist. Without one, the default
    /// file is used if present and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.changeset_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "changeset_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "database_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.lock_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Upload limit, `None` when unlimited
    pub fn upload_limit(&self) -> Option<u64> {
        (self.max_upload_bytes > 0).then_some(self.max_upload_bytes)
    }
}
