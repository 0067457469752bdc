//! Error types for proxy sessions.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that end a single proxied session.
///
/// None of these are retried and none affect other sessions.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The stream ended or errored before enough bytes could be peeked.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    PeekShortRead { wanted: usize, got: usize },

    /// The first record is not a TLS handshake carrying a server name.
    #[error("tls sniff failed: {0}")]
    TlsSniffFailed(&'static str),

    /// The sniffed hostname could not be resolved, or resolved to nothing.
    #[error("resolution failed for {host}: {}", .reason.as_deref().unwrap_or("no addresses"))]
    ResolutionFailed {
        host: String,
        reason: Option<String>,
    },

    /// The origin could not be reached within the connect timeout.
    #[error("dial {addr} failed: {source}")]
    DialFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A tunnel direction hit an I/O error after it was established.
    #[error("relay error: {0}")]
    RelayIo(#[source] io::Error),

    /// The plaintext HTTP path failed.
    #[error("http forward failed: {0}")]
    Http(String),

    /// Any other socket error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Short stable code for this error, used in structured logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::PeekShortRead { .. } => "peek_short_read",
            ProxyError::TlsSniffFailed(_) => "tls_sniff_failed",
            ProxyError::ResolutionFailed { .. } => "resolution_failed",
            ProxyError::DialFailed { .. } => "dial_failed",
            ProxyError::RelayIo(_) => "relay_io",
            ProxyError::Http(_) => "http_failed",
            ProxyError::Io(_) => "io",
        }
    }
}
