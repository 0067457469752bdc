//! gacha-proxy
//!
//! Transparent TCP proxy.
//!
//! This service:
//! - Accepts raw TCP connections on one port
//! - Forwards plaintext `GET`/`POST` requests through an HTTP client
//! - Sniffs SNI from TLS ClientHellos and splices the stream to `<sni>:443`
//! - Emits one access log line per session milestone

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gacha_proxy::{Config, Listener, ListenerConfig, LogFormat, SystemResolver, TracingAccessLog};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GACHA_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting gacha-proxy");
    info!(
        bind_addr = %config.bind_addr,
        upstream_port = config.upstream_port,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        idle_timeout_ms = config.idle_timeout.map(|t| t.as_millis() as u64),
        "Configuration loaded"
    );

    let listener = Listener::bind(
        ListenerConfig::from(&config),
        Arc::new(SystemResolver),
        Arc::new(TracingAccessLog),
    )
    .await
    .with_context(|| format!("Failed to bind listener on {}", config.bind_addr))?;

    Arc::new(listener).run().await?;
    Ok(())
}
