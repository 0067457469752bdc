//! Hostname resolution and origin connection.
//!
//! - Only the first resolved address is tried (no failover)
//! - Connect timeout: 10s default
//! - Upstream port: 443 default

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

/// Default connect timeout for origin connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default port dialed for SNI passthrough.
pub const DEFAULT_UPSTREAM_PORT: u16 = 443;

/// Hostname resolution.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `host` to its addresses, in the order the resolver returned them.
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Turns a hostname into a connected origin socket.
#[derive(Debug, Clone)]
pub struct Dialer {
    upstream_port: u16,
    connect_timeout: Duration,
}

impl Dialer {
    /// Create a dialer targeting `upstream_port`.
    pub fn new(upstream_port: u16, connect_timeout: Duration) -> Self {
        Self {
            upstream_port,
            connect_timeout,
        }
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream_port
    }

    /// Socket address dialed for a resolved origin IP.
    pub fn target(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.upstream_port)
    }

    /// Resolve `host` and pick the first address.
    pub async fn resolve(&self, resolver: &dyn Resolve, host: &str) -> Result<IpAddr, ProxyError> {
        match resolver.resolve(host).await {
            Ok(addrs) => match addrs.first() {
                Some(ip) => {
                    debug!(
                        hostname = %host,
                        resolved = %ip,
                        candidates = addrs.len(),
                        "Resolved origin"
                    );
                    Ok(*ip)
                }
                None => Err(ProxyError::ResolutionFailed {
                    host: host.to_string(),
                    reason: None,
                }),
            },
            Err(e) => Err(ProxyError::ResolutionFailed {
                host: host.to_string(),
                reason: Some(e.to_string()),
            }),
        }
    }

    /// Open a TCP connection to `ip` on the upstream port.
    pub async fn connect(&self, ip: IpAddr) -> Result<TcpStream, ProxyError> {
        let addr = self.target(ip);
        debug!(origin_addr = %addr, "Connecting to origin");

        let result = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        };
        result.map_err(|source| ProxyError::DialFailed { addr, source })
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_PORT, DEFAULT_CONNECT_TIMEOUT)
    }
}
