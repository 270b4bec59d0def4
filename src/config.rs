//! Server configuration.
//!
//! Loaded from a YAML file named by `TUPLEGATE_CONFIG` (or `--config` on the
//! command line). Every section and field has a default, so an empty file or
//! no file at all yields a runnable server. `LISTEN` overrides the listen
//! address either way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::http::connection::ConnectionSettings;
use crate::proxy::ProxySettings;

pub const CONFIG_ENV: &str = "TUPLEGATE_CONFIG";
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Wait for the first request on a new connection
    pub read_timeout_ms: u64,
    /// Wait between checks on an idle persistent connection
    pub idle_wait_ms: u64,
    pub max_idle_ticks: u32,
    /// Tuple served for a path ending in `/`
    pub index_name: String,
    /// Shown at the bottom of error pages
    pub server_name: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            read_timeout_ms: 30_000,
            idle_wait_ms: 100,
            max_idle_ticks: 50,
            index_name: "index.html".to_string(),
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub bindings: usize,
    /// Zero disables the tuple cache
    pub tuples: usize,
    pub tuple_size_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bindings: 32,
            tuples: 128,
            tuple_size_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory loaded into the in-memory store at startup
    pub root_dir: Option<PathBuf>,
    pub segment_threshold: usize,
    pub lease_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            segment_threshold: 64 * 1024,
            lease_secs: 60,
            request_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Loads the file named by `TUPLEGATE_CONFIG` if set, otherwise the
    /// defaults, then applies `LISTEN`.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Self::finish(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // an empty document deserializes as unit, not as an empty mapping
        let config = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        Self::finish(config)
    }

    fn finish(mut config: Self) -> Result<Self, ConfigError> {
        if let Ok(listen_addr) = std::env::var(LISTEN_ENV) {
            config.server.listen_addr = listen_addr;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("pool.workers", self.pool.workers),
            ("pool.queue_capacity", self.pool.queue_capacity),
            ("cache.bindings", self.cache.bindings),
            ("store.segment_threshold", self.store.segment_threshold),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.store.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("store.request_timeout_ms"));
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            read_timeout: Duration::from_millis(self.server.read_timeout_ms),
            idle_wait: Duration::from_millis(self.server.idle_wait_ms),
            max_idle_ticks: self.server.max_idle_ticks,
            segment_threshold: self.store.segment_threshold,
            index_name: self.server.index_name.clone(),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            binding_capacity: self.cache.bindings,
            tuple_capacity: self.cache.tuples,
            tuple_cache_limit: self.cache.tuple_size_limit,
            request_timeout: Duration::from_millis(self.store.request_timeout_ms),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.store.lease_secs)
    }
}
