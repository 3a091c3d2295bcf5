//! Built-in defaults
//!
//! Hardcoded defaults for every configuration value.

use std::path::PathBuf;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "dam-cache.toml";

pub(crate) fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}

pub(crate) fn default_database_path() -> PathBuf {
    PathBuf::from("dam-cache.db")
}

pub(crate) fn default_changeset_path() -> PathBuf {
    PathBuf::from("/var/lib/dam-cache/changesets")
}

pub(crate) fn default_support_archive_path() -> PathBuf {
    PathBuf::from("/opt/ckm-mirror/transform-support.zip")
}

/// Returned verbatim by `isCachingEnabled`
pub(crate) fn default_caching_enabled() -> String {
    "true".to_string()
}

pub(crate) fn default_lock_timeout_secs() -> u64 {
    30
}

/// 1 GiB
pub(crate) fn default_max_upload_bytes() -> u64 {
    1024 * 1024 * 1024
}
