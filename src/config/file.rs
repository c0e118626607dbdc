//! TOML configuration file loading
//!
//! Supports `~/.config/conversa/config.toml` as a persistent config source.
//! All fields are optional: the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::sync::{MergeConfig, PackLimits};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConversaConfigFile {
    /// HTTP server and storage
    pub server: ServerFileConfig,

    /// Scheduling, timeouts and backoff
    pub sync: SyncFileConfig,

    /// Source priority and per-field strategies
    pub merge: MergeConfig,

    /// Pack and snapshot size caps
    pub limits: PackLimits,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Bearer key for admin endpoints
    pub api_key: Option<String>,

    /// Directory holding the database
    pub data_dir: Option<String>,
}

/// Sync configuration
#[derive(Debug, Default, Deserialize)]
pub struct SyncFileConfig {
    pub enabled: Option<bool>,
    pub tick_interval_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub sweep_timeout_secs: Option<u64>,
    pub worker_pool_size: Option<usize>,
    pub per_source_concurrency: Option<usize>,
    pub per_source_requests_per_minute: Option<u32>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub fatal_retry_secs: Option<u64>,
    pub debounce_secs: Option<u64>,
    pub snapshot_history_limit: Option<usize>,
    /// Audience tag sent to sources
    pub audience: Option<String>,
}

/// Parse a config file body
///
/// # Errors
///
/// Returns error if the body is not valid TOML for this schema
pub fn parse_config(content: &str) -> Result<ConversaConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `ConversaConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConversaConfigFile {
    config_file_path().map_or_else(ConversaConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a config file from `path`, falling back to defaults on any failure
pub fn load_config_file_from(path: &Path) -> ConversaConfigFile {
    if !path.exists() {
        return ConversaConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConversaConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConversaConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/conversa/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("conversa").join("config.toml"))
}
