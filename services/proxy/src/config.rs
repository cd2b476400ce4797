//! Proxy process configuration.
//!
//! Services themselves are configured at runtime through the admin API;
//! this only covers the process level listeners and limits.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::proxy::DEFAULT_MAX_CONNECTIONS;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin API listen address.
    pub admin_addr: SocketAddr,

    /// Data-plane HTTP listener; `None` disables host routing.
    pub http_addr: Option<SocketAddr>,

    /// Optional snapshot file used to persist and seed service config.
    pub state_file: Option<PathBuf>,

    /// Per-service concurrent TCP connection cap.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let admin_addr: SocketAddr = var("GHOST_PROXY_ADMIN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:9090".to_string())
            .parse::<SocketAddr>()
            .context("GHOST_PROXY_ADMIN_ADDR must be a socket address (host:port).")?;

        let http_addr: Option<SocketAddr> = var("GHOST_PROXY_HTTP_ADDR")
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse::<SocketAddr>())
            .transpose()
            .context("GHOST_PROXY_HTTP_ADDR must be a socket address (host:port).")?;

        let state_file = var("GHOST_PROXY_STATE_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let max_connections = var("GHOST_PROXY_MAX_CONNECTIONS")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("GHOST_PROXY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level = var("GHOST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            admin_addr,
            http_addr,
            state_file,
            max_connections,
            log_level,
        })
    }
}
