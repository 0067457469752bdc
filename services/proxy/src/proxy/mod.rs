//! Connection classification, SNI sniffing and splicing.
//!
//! This module provides:
//! - Peek-preserving buffered reads
//! - Protocol classification (plaintext HTTP vs TLS)
//! - SNI extraction from the first TLS record
//! - Hostname resolution and origin dialing
//! - Bidirectional splicing with half-close
//! - Plaintext HTTP forwarding
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Classifier -+-> HTTP Forwarder -> reqwest -> Origin
//!                                   |
//!                                   +-> SNI Extractor -> Resolver/Dialer -> Tunnel -> Origin:443
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, SystemResolver};
//! use access_log::TracingAccessLog;
//!
//! let config = ListenerConfig::new("0.0.0.0:8510".parse()?);
//! let listener = Listener::bind(config, Arc::new(SystemResolver), Arc::new(TracingAccessLog)).await?;
//! Arc::new(listener).run().await?;
//! ```

mod classify;
mod dialer;
mod http;
mod listener;
mod peek;
mod sni;
mod tunnel;

pub use classify::{classify, classify_prefix, Protocol, Sniff, CLASSIFY_PREFIX_LEN};
pub use dialer::{
    Dialer, Resolve, SystemResolver, DEFAULT_CONNECT_TIMEOUT, DEFAULT_UPSTREAM_PORT,
};
pub use http::{
    read_request, write_error, write_response, HttpForwarder, ParsedRequest, RequestError,
    UpstreamResponse, MAX_BODY_LEN, MAX_HEAD_LEN,
};
pub use listener::{Listener, ListenerConfig, ListenerStats, Session, SessionHandler};
pub use peek::PeekReader;
pub use sni::{normalize_hostname, parse_sni, sniff_server_name, SniResult};
pub use tunnel::{splice, tunnel, TunnelStats};
