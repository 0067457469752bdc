//! Proxy configuration.
//!
//! Everything is read from the environment once at startup and passed into
//! the listener as a value.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_UPSTREAM_PORT};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8510";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub bind_addr: SocketAddr,

    /// Port dialed on the resolved origin for SNI passthrough.
    pub upstream_port: u16,

    /// Origin connect timeout.
    pub connect_timeout: Duration,

    /// Optional per-read idle timeout on established tunnels.
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("GACHA_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("GACHA_BIND_ADDR must be a socket address (example: 0.0.0.0:8510).")?;

        let upstream_port = lookup("GACHA_UPSTREAM_PORT")
            .map(|v| v.parse::<u16>())
            .transpose()
            .context("GACHA_UPSTREAM_PORT must be a port number.")?
            .unwrap_or(DEFAULT_UPSTREAM_PORT);

        let connect_timeout = lookup("GACHA_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("GACHA_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let idle_timeout = lookup("GACHA_IDLE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("GACHA_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let log_level = lookup("GACHA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match lookup("GACHA_LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            Some(other) => anyhow::bail!(
                "GACHA_LOG_FORMAT must be 'json' or 'text', got '{}'.",
                other
            ),
        };

        Ok(Self {
            bind_addr,
            upstream_port,
            connect_timeout,
            idle_timeout,
            log_level,
            log_format,
        })
    }
}
