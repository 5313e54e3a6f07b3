//! Core configuration loading
//!
//! All environment variables are read once at startup into an immutable
//! [`CoreConfig`]; services pass it explicitly instead of re-reading the
//! environment. Unparseable values are rejected early with a `Config` error
//! rather than silently falling back.

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Immutable core configuration shared by all PriceWire services
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding the SQLite database
    pub data_dir: PathBuf,
    pub stream_batch_size: usize,
    pub stream_poll_interval_ms: u64,
    pub stream_max_retries: u32,
    pub graceful_shutdown_timeout_ms: u64,
    pub enable_sota_models: bool,
    pub notify_dedup_ttl_seconds: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_window_ms: u64,
}

impl CoreConfig {
    /// Load core configuration from the environment.
    ///
    /// `data_dir_override` comes from the command line and wins over the
    /// `PRICEWIRE_DATA_DIR` environment variable, which wins over the
    /// compiled default `./pricewire_data`.
    pub fn from_env(data_dir_override: Option<&Path>) -> Result<Self> {
        Ok(Self {
            data_dir: resolve_data_dir(data_dir_override),
            stream_batch_size: env_parse("STREAM_BATCH_SIZE", 50)?,
            stream_poll_interval_ms: env_parse("STREAM_POLL_INTERVAL_MS", 2000)?,
            stream_max_retries: env_parse("STREAM_MAX_RETRIES", 5)?,
            graceful_shutdown_timeout_ms: env_parse("GRACEFUL_SHUTDOWN_TIMEOUT", 30_000)?,
            enable_sota_models: env_bool("ENABLE_SOTA_MODELS", false)?,
            notify_dedup_ttl_seconds: env_parse("NOTIFY_DEDUP_TTL_SECONDS", 86_400)?,
            circuit_breaker_threshold: env_parse("CIRCUIT_BREAKER_THRESHOLD", 3)?,
            circuit_breaker_window_ms: env_parse("CIRCUIT_BREAKER_WINDOW_MS", 300_000)?,
        })
    }

    /// Path of the shared SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("pricewire.db")
    }
}

/// Data directory resolution priority: CLI argument, environment variable,
/// compiled default.
pub fn resolve_data_dir(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("PRICEWIRE_DATA_DIR") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("pricewire_data")
}

/// Parse an environment variable, falling back to `default` when unset.
///
/// An unset variable is fine; a set-but-unparseable one is a configuration
/// error and fails startup.
pub fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}"))),
        _ => Ok(default),
    }
}

/// Parse a boolean environment variable ("1"/"true"/"yes" are true)
pub fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::Config(format!(
                "invalid boolean for {name}: {other:?}"
            ))),
        },
        _ => Ok(default),
    }
}

/// Read a required environment variable, rejecting missing values early
pub fn env_required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{name} must be set"))),
    }
}

/// Read an optional environment variable (empty counts as unset)
pub fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
