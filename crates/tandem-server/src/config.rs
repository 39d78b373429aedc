//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tandem_shared::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FILE_MAX_AGE_SECS, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT,
    DEFAULT_OUTBOUND_BUFFER, MAX_FILE_SIZE,
};

use crate::coordinator::CoordinatorConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR` (`PORT` overrides only the port)
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Directory holding uploaded files and chunk directories.
    /// Env: `FILE_STORAGE_PATH`
    /// Default: `./uploads`
    pub file_storage_path: PathBuf,

    /// Maximum stored file size in bytes.
    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: usize,

    /// Files older than this are purged.
    /// Env: `FILE_MAX_AGE_SECS`
    pub file_max_age: Duration,

    /// How often the purge runs.
    /// Env: `FILE_CLEANUP_INTERVAL_SECS`
    pub file_cleanup_interval: Duration,

    /// Template content slice size, in characters.
    /// Env: `CHUNK_SIZE`
    pub chunk_size: usize,

    /// Frames queued per connection before sends start dropping.
    /// Env: `OUTBOUND_BUFFER`
    pub outbound_buffer: usize,

    /// Default `get-message-history` limit.
    /// Env: `MESSAGE_HISTORY_LIMIT`
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Tandem Node".to_string(),
            file_storage_path: PathBuf::from("./uploads"),
            max_file_size: MAX_FILE_SIZE,
            file_max_age: Duration::from_secs(DEFAULT_FILE_MAX_AGE_SECS),
            file_cleanup_interval: Duration::from_secs(3600),
            chunk_size: DEFAULT_CHUNK_SIZE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.http_addr.set_port(port);
        }

        if let Some(name) = lookup("INSTANCE_NAME").filter(|n| !n.is_empty()) {
            config.instance_name = name;
        }

        if let Some(path) = lookup("FILE_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.file_storage_path = PathBuf::from(path);
        }

        if let Some(size) = parse_var::<usize>(&lookup, "MAX_FILE_SIZE").filter(|n| *n > 0) {
            config.max_file_size = size;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "FILE_MAX_AGE_SECS") {
            config.file_max_age = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "FILE_CLEANUP_INTERVAL_SECS").filter(|n| *n > 0) {
            config.file_cleanup_interval = Duration::from_secs(secs);
        }

        if let Some(size) = parse_var::<usize>(&lookup, "CHUNK_SIZE").filter(|n| *n > 0) {
            config.chunk_size = size;
        }

        if let Some(depth) = parse_var::<usize>(&lookup, "OUTBOUND_BUFFER").filter(|n| *n > 0) {
            config.outbound_buffer = depth;
        }

        if let Some(limit) = parse_var::<usize>(&lookup, "MESSAGE_HISTORY_LIMIT") {
            config.history_limit = limit;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            chunk_size: self.chunk_size,
            history_limit: self.history_limit,
            ..CoordinatorConfig::default()
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
