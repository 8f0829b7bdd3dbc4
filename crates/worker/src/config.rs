// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI/environment layer and the fleet config file layer.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::panel::Panel;
use crate::state::SyncMode;

/// CLI flags, every field also settable via environment variable.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "fleetsync-worker", about = "Fleet inventory and traffic reconciliation worker")]
pub struct WorkerArgs {
    /// Path to the JSON fleet config file.
    #[arg(long, default_value = "config.json", env = "CONFIG_FILE")]
    pub config_file: PathBuf,

    /// Directory for the heartbeat file and the default database location.
    #[arg(long, default_value = "./data", env = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Explicit override for the database file path.
    #[arg(long, env = "DB_FILE")]
    pub db_file: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    pub log_format: String,

    /// Also write `{data_dir}/sync.log` in addition to stdout.
    #[arg(long, default_value_t = false, env = "ENABLE_FILE_LOG")]
    pub enable_file_log: bool,
}

impl WorkerArgs {
    pub fn db_path(&self) -> PathBuf {
        self.db_file.clone().unwrap_or_else(|| self.data_dir.join("traffic_state.db"))
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.data_dir.join(".heartbeat")
    }

    pub fn file_log_path(&self) -> PathBuf {
        self.data_dir.join("sync.log")
    }
}

fn default_sync_interval_minutes() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    8
}

fn default_request_timeout() -> u64 {
    10
}

fn default_validate_ttl_seconds() -> u64 {
    60
}

fn default_connect_pool_size() -> usize {
    50
}

fn default_cache_size_mb() -> u32 {
    20
}

/// Network tunables, each independently overridable by its own env var.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_true")]
    pub parallel_node_calls: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_validate_ttl_seconds")]
    pub validate_ttl_seconds: u64,
    #[serde(default = "default_connect_pool_size")]
    pub connect_pool_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            parallel_node_calls: default_true(),
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            validate_ttl_seconds: default_validate_ttl_seconds(),
            connect_pool_size: default_connect_pool_size(),
        }
    }
}

/// Local database durability knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_true")]
    pub wal: bool,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u32,
}

fn default_synchronous() -> String {
    "NORMAL".to_owned()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { wal: true, synchronous: default_synchronous(), cache_size_mb: default_cache_size_mb() }
    }
}

impl DbConfig {
    pub fn sync_mode(&self) -> SyncMode {
        SyncMode::parse(&self.synchronous).unwrap_or(SyncMode::Normal)
    }
}

/// Fleet topology and tunables, loaded from a JSON file with environment
/// overrides layered on top (matching the reference implementation's
/// `ConfigManager`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub central_server: Panel,
    #[serde(default)]
    pub nodes: Vec<Panel>,
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u32,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub db: DbConfig,
}

impl FleetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fleet config file at {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing fleet config file at {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.central_server.url.trim().is_empty() {
            bail!("fleet config is missing a central_server");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env("SYNC_INTERVAL_MINUTES") {
            self.sync_interval_minutes = v;
        }
        if let Some(v) = parse_bool_env("NET_PARALLEL_NODE_CALLS") {
            self.net.parallel_node_calls = v;
        }
        if let Some(v) = parse_env::<usize>("NET_MAX_WORKERS") {
            self.net.max_workers = v.max(1);
        }
        if let Some(v) = parse_env("NET_REQUEST_TIMEOUT") {
            self.net.request_timeout = v;
        }
        if let Some(v) = parse_env("NET_VALIDATE_TTL_SECONDS") {
            self.net.validate_ttl_seconds = v;
        }
        if let Some(v) = parse_env("NET_CONNECT_POOL_SIZE") {
            self.net.connect_pool_size = v;
        }
        if let Some(v) = parse_bool_env("DB_WAL") {
            self.db.wal = v;
        }
        if let Ok(raw) = std::env::var("DB_SYNCHRONOUS") {
            if SyncMode::parse(&raw).is_some() {
                self.db.synchronous = raw.to_ascii_uppercase();
            } else {
                warn!(value = %raw, "ignoring invalid DB_SYNCHRONOUS override");
            }
        }
        if let Some(v) = parse_env("DB_CACHE_SIZE_MB") {
            self.db.cache_size_mb = v;
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
