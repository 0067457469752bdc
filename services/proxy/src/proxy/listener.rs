//! TCP listener and per-connection session handling.
//!
//! Every accepted socket becomes a [`Session`] owned by its own task:
//! - Peek and classify the first bytes
//! - Plaintext HTTP is parsed and forwarded
//! - TLS is sniffed for SNI, resolved, dialed and spliced to the origin
//!
//! No state is shared between sessions apart from atomic statistics.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use super::classify::{classify, Sniff};
use super::dialer::{Dialer, Resolve, DEFAULT_CONNECT_TIMEOUT, DEFAULT_UPSTREAM_PORT};
use super::http::{read_request, write_error, write_response, HttpForwarder, RequestError};
use super::peek::PeekReader;
use super::tunnel::tunnel;
use crate::access_log::{AccessEntry, AccessLog, Event, Outcome};
use crate::config::Config;
use crate::error::ProxyError;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Port dialed on the resolved origin.
    pub upstream_port: u16,
    /// Origin connect timeout (also used by the HTTP client).
    pub connect_timeout: Duration,
    /// Idle timeout for tunnel reads. None keeps tunnels open indefinitely.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            upstream_port: DEFAULT_UPSTREAM_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl From<&Config> for ListenerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.bind_addr,
            upstream_port: config.upstream_port,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Plaintext HTTP requests relayed.
    pub http_forwarded: AtomicU64,
    /// Plaintext HTTP requests answered with an error.
    pub http_failed: AtomicU64,
    /// SNI extraction successes.
    pub sni_found: AtomicU64,
    /// Sessions abandoned for lack of a server name (not TLS, no SNI, short read).
    pub sni_failed: AtomicU64,
    /// Hostname resolution failures.
    pub dns_failed: AtomicU64,
    /// Origin connection failures.
    pub dial_failed: AtomicU64,
    /// Tunnels established.
    pub tunnels_opened: AtomicU64,
    /// Bytes proxied to origins.
    pub bytes_to_origin: AtomicU64,
    /// Bytes proxied from origins.
    pub bytes_from_origin: AtomicU64,
}

/// One accepted connection.
pub struct Session {
    pub client_ip: IpAddr,
    /// Correlates every log line of this connection.
    pub connection_id: String,
    pub reader: PeekReader<TcpStream>,
}

impl Session {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, connection_id: String) -> Self {
        Self {
            client_ip: peer_addr.ip(),
            connection_id,
            reader: PeekReader::new(stream),
        }
    }
}

/// How a classified session is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHandler {
    /// Parse and re-issue a plaintext request.
    HttpForward,
    /// Splice raw bytes to the origin named by SNI.
    SniPassthrough { hostname: String },
}

impl SessionHandler {
    /// Pick the handler for a classification result, if the session can be
    /// served at all.
    pub fn select(sniff: Sniff) -> Result<Self, ProxyError> {
        match sniff {
            Sniff::PlaintextHttp => Ok(SessionHandler::HttpForward),
            Sniff::TlsWithHostname(hostname) => Ok(SessionHandler::SniPassthrough { hostname }),
            Sniff::TlsWithoutHostname => Err(ProxyError::TlsSniffFailed("no server name")),
            Sniff::Unclassifiable => Err(ProxyError::TlsSniffFailed("not a tls handshake")),
        }
    }

    async fn run(self, listener: &Listener, session: Session) -> Result<(), ProxyError> {
        match self {
            SessionHandler::HttpForward => listener.forward_http(session).await,
            SessionHandler::SniPassthrough { hostname } => {
                listener.passthrough(session, hostname).await
            }
        }
    }
}

/// Access log writer bound to one session.
struct SessionLog<'a> {
    sink: &'a dyn AccessLog,
    client_ip: IpAddr,
    connection_id: &'a str,
}

impl SessionLog<'_> {
    fn record(&self, status: u16, event: Event, target: &str, outcome: Outcome) {
        self.sink.record(&AccessEntry {
            client_ip: self.client_ip,
            status,
            event,
            connection_id: self.connection_id.to_string(),
            target: target.to_string(),
            outcome,
        });
    }
}

/// A TCP listener for the proxy.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Origin dialer.
    dialer: Dialer,
    /// Hostname resolver.
    resolver: Arc<dyn Resolve>,
    /// Access log sink.
    access_log: Arc<dyn AccessLog>,
    /// Client for the plaintext HTTP path.
    forwarder: HttpForwarder,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        resolver: Arc<dyn Resolve>,
        access_log: Arc<dyn AccessLog>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let forwarder = HttpForwarder::new(config.connect_timeout).map_err(io::Error::other)?;

        info!(
            bind_addr = %local_addr,
            upstream_port = config.upstream_port,
            "Listener bound"
        );

        Ok(Self {
            dialer: Dialer::new(config.upstream_port, config.connect_timeout),
            listener,
            config,
            resolver,
            access_log,
            forwarder,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let connection_id = Uuid::new_v4().to_string();
                    let span = tracing::info_span!(
                        "connection",
                        peer = %peer_addr,
                        connection_id = %connection_id
                    );
                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            let session = Session::new(stream, peer_addr, connection_id);
                            if let Err(e) = listener.handle_connection(session).await {
                                debug!(
                                    error = %e,
                                    reason = e.reason_code(),
                                    "Session ended without proxying"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, mut session: Session) -> Result<(), ProxyError> {
        debug!(client_ip = %session.client_ip, "Connection accepted");

        let sniff = match classify(&mut session.reader).await {
            Ok(sniff) => sniff,
            Err(e) => {
                if matches!(e, ProxyError::PeekShortRead { .. }) {
                    self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };
        debug!(sniff = ?sniff, "Connection classified");

        let handler = match SessionHandler::select(sniff) {
            Ok(handler) => handler,
            Err(e) => {
                self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        handler.run(self, session).await
    }

    /// Resolve, dial and splice a TLS session to its origin.
    async fn passthrough(&self, session: Session, hostname: String) -> Result<(), ProxyError> {
        self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
        debug!(hostname = %hostname, "SNI extracted");

        let Session {
            client_ip,
            connection_id,
            reader,
        } = session;
        let log = SessionLog {
            sink: self.access_log.as_ref(),
            client_ip,
            connection_id: &connection_id,
        };
        let target = format!("{}:{}", hostname, self.dialer.upstream_port());

        let ip = match self.dialer.resolve(self.resolver.as_ref(), &hostname).await {
            Ok(ip) => ip,
            Err(e) => {
                self.stats.dns_failed.fetch_add(1, Ordering::Relaxed);
                let reason = match &e {
                    ProxyError::ResolutionFailed { reason, .. } => reason.clone(),
                    _ => None,
                };
                log.record(500, Event::Connect, &target, Outcome::DnsFail(reason));
                return Err(e);
            }
        };

        let origin = match self.dialer.connect(ip).await {
            Ok(origin) => origin,
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                log.record(500, Event::Connect, &target, Outcome::ConnFail(ip));
                return Err(e);
            }
        };

        self.stats.tunnels_opened.fetch_add(1, Ordering::Relaxed);
        log.record(200, Event::Connect, &target, Outcome::SniDirect(ip));

        let relayed = tunnel(reader, origin, self.config.idle_timeout).await;

        self.stats
            .bytes_to_origin
            .fetch_add(relayed.client_to_origin, Ordering::Relaxed);
        self.stats
            .bytes_from_origin
            .fetch_add(relayed.origin_to_client, Ordering::Relaxed);
        debug!(
            bytes_to_origin = relayed.client_to_origin,
            bytes_from_origin = relayed.origin_to_client,
            "Tunnel closed"
        );

        log.record(200, Event::Close, &target, Outcome::SniDirect(ip));
        Ok(())
    }

    /// Serve one plaintext request, then close the connection.
    async fn forward_http(&self, session: Session) -> Result<(), ProxyError> {
        let Session {
            client_ip,
            connection_id,
            mut reader,
        } = session;
        let log = SessionLog {
            sink: self.access_log.as_ref(),
            client_ip,
            connection_id: &connection_id,
        };

        let result = self.serve_http(&mut reader, &log).await;
        if let Err(e) = reader.get_mut().shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        result
    }

    async fn serve_http(
        &self,
        reader: &mut PeekReader<TcpStream>,
        log: &SessionLog<'_>,
    ) -> Result<(), ProxyError> {
        let request = match read_request(reader).await {
            Ok(request) => request,
            Err(e) => return self.fail_http(reader, log, "-", e).await,
        };

        let target = request
            .target_url()
            .unwrap_or_else(|_| request.uri.clone());
        let method = request.method.clone();
        info!(method = %method, uri = %request.uri, "HTTP request");

        let response = match self.forwarder.forward(request).await {
            Ok(response) => response,
            Err(e) => return self.fail_http(reader, log, &target, e).await,
        };

        let status = response.status;
        let written = write_response(reader.get_mut(), response).await;
        self.stats.http_forwarded.fetch_add(1, Ordering::Relaxed);
        log.record(
            status.as_u16(),
            Event::Request,
            &target,
            Outcome::HttpDirect(method),
        );

        let body_len = written.map_err(ProxyError::Io)?;
        debug!(body_len, "Response relayed");
        Ok(())
    }

    async fn fail_http(
        &self,
        reader: &mut PeekReader<TcpStream>,
        log: &SessionLog<'_>,
        target: &str,
        err: RequestError,
    ) -> Result<(), ProxyError> {
        self.stats.http_failed.fetch_add(1, Ordering::Relaxed);
        let status = err.status();

        if let Err(e) = write_error(reader.get_mut(), status, &err.to_string()).await {
            debug!(error = %e, "Failed to write error response");
        }
        log.record(
            status.as_u16(),
            Event::Request,
            target,
            Outcome::HttpFail(err.code().to_string()),
        );
        Err(ProxyError::Http(err.to_string()))
    }
}
