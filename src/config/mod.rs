//! Configuration management for the Conversa gateway
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::sync::{BackoffPolicy, MergeConfig, PackLimits, SyncSettings};
use crate::{Error, Result};

use self::file::ConversaConfigFile;

/// Default HTTP API port
pub const DEFAULT_PORT: u16 = 18790;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// HTTP API server configuration
    pub server: ServerConfig,

    /// Context sync configuration
    pub sync: SyncConfig,

    /// Source priority and per-field merge strategies
    pub merge: MergeConfig,

    /// Pack and snapshot size caps
    pub limits: PackLimits,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for admin endpoints (from `CONVERSA_API_KEY` env)
    pub api_key: Option<String>,
}

/// Context sync configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Run the background orchestrator
    pub enabled: bool,
    pub tick_interval_secs: u64,
    /// Per-fetch HTTP timeout
    pub fetch_timeout_secs: u64,
    /// Deadline for all fetches of one user sweep
    pub sweep_timeout_secs: u64,
    pub worker_pool_size: usize,
    pub per_source_concurrency: usize,
    pub per_source_requests_per_minute: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub fatal_retry_secs: u64,
    /// Window in which repeated read misses send one sync signal
    pub debounce_secs: u64,
    pub snapshot_history_limit: usize,
    /// Audience tag sent with every fetch
    pub audience: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 30,
            fetch_timeout_secs: 30,
            sweep_timeout_secs: 60,
            worker_pool_size: 16,
            per_source_concurrency: 4,
            per_source_requests_per_minute: 120,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            fatal_retry_secs: 6 * 3600,
            debounce_secs: 30,
            snapshot_history_limit: 10,
            audience: "conversa".to_string(),
        }
    }
}

impl SyncConfig {
    /// Orchestrator settings
    #[must_use]
    pub const fn settings(&self) -> SyncSettings {
        SyncSettings {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            sweep_timeout: Duration::from_secs(self.sweep_timeout_secs),
            worker_pool_size: self.worker_pool_size,
            per_source_concurrency: self.per_source_concurrency,
            per_source_requests_per_minute: self.per_source_requests_per_minute,
            backoff: BackoffPolicy {
                base_delay: Duration::from_secs(self.backoff_base_secs),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                fatal_delay: Duration::from_secs(self.fatal_retry_secs),
            },
        }
    }

    /// Per-fetch timeout
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Read-miss debounce window
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(Error::Config("sync.tick_interval_secs must be positive".to_string()));
        }
        if self.fetch_timeout_secs == 0 || self.sweep_timeout_secs == 0 {
            return Err(Error::Config("sync timeouts must be positive".to_string()));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(Error::Config(format!(
                "sync.backoff_base_secs ({}) exceeds sync.backoff_max_secs ({})",
                self.backoff_base_secs, self.backoff_max_secs
            )));
        }
        if self.audience.trim().is_empty() {
            return Err(Error::Config("sync.audience must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Default data directory: `~/.local/share/conversa` on Linux
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/conversa"),
        |d| d.data_dir().join("conversa"),
    )
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|s| s.parse().ok())
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, &|key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn from_sources(
        fc: ConversaConfigFile,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let data_dir = env("CONVERSA_DATA_DIR")
            .or(fc.server.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let server = ServerConfig {
            port: parse_env(env, "CONVERSA_API_PORT")
                .or_else(|| parse_env(env, "PORT"))
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: env("CONVERSA_API_KEY").or(fc.server.api_key),
        };

        let default = SyncConfig::default();
        let fs = fc.sync;
        let sync = SyncConfig {
            enabled: env("CONVERSA_SYNC_ENABLED")
                .map(|v| parse_bool(&v))
                .or(fs.enabled)
                .unwrap_or(default.enabled),
            tick_interval_secs: parse_env(env, "CONVERSA_SYNC_TICK_SECS")
                .or(fs.tick_interval_secs)
                .unwrap_or(default.tick_interval_secs),
            fetch_timeout_secs: fs.fetch_timeout_secs.unwrap_or(default.fetch_timeout_secs),
            sweep_timeout_secs: fs.sweep_timeout_secs.unwrap_or(default.sweep_timeout_secs),
            worker_pool_size: fs.worker_pool_size.unwrap_or(default.worker_pool_size),
            per_source_concurrency: fs
                .per_source_concurrency
                .unwrap_or(default.per_source_concurrency),
            per_source_requests_per_minute: fs
                .per_source_requests_per_minute
                .unwrap_or(default.per_source_requests_per_minute),
            backoff_base_secs: fs.backoff_base_secs.unwrap_or(default.backoff_base_secs),
            backoff_max_secs: fs.backoff_max_secs.unwrap_or(default.backoff_max_secs),
            fatal_retry_secs: fs.fatal_retry_secs.unwrap_or(default.fatal_retry_secs),
            debounce_secs: fs.debounce_secs.unwrap_or(default.debounce_secs),
            snapshot_history_limit: fs
                .snapshot_history_limit
                .unwrap_or(default.snapshot_history_limit),
            audience: env("CONVERSA_SYNC_AUDIENCE")
                .or(fs.audience)
                .unwrap_or(default.audience),
        };
        sync.validate()?;

        Ok(Self {
            data_dir,
            server,
            sync,
            merge: fc.merge,
            limits: fc.limits,
        })
    }

    /// Path of the SQLite database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("conversa.db")
    }
}
