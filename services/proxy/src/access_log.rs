//! Access log lines, one per session milestone.
//!
//! Format:
//!
//! ```text
//! <clientIP> <PROTOCOL>/<status> <event> <connectionID> <target> - <outcome>/<detail>
//! ```
//!
//! A successful tunnel produces exactly two lines (`CONNECT` and `CLOSE`)
//! carrying the same connection ID.

use std::fmt;
use std::net::IpAddr;

use tracing::info;

/// Lifecycle event being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    Close,
    Request,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Connect => "CONNECT",
            Event::Close => "CLOSE",
            Event::Request => "REQUEST",
        }
    }
}

/// How the session was served, with its detail field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Tunnel to the resolved origin IP.
    SniDirect(IpAddr),
    /// Dial to the resolved origin IP failed.
    ConnFail(IpAddr),
    /// Resolution failed; `None` when it simply returned no addresses.
    DnsFail(Option<String>),
    /// Plaintext request forwarded with this method.
    HttpDirect(String),
    /// Plaintext request could not be served.
    HttpFail(String),
}

impl Outcome {
    fn protocol(&self) -> &'static str {
        match self {
            Outcome::SniDirect(_) | Outcome::ConnFail(_) | Outcome::DnsFail(_) => {
                "SNI_TRANSPARENT"
            }
            Outcome::HttpDirect(_) | Outcome::HttpFail(_) => "HTTP",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::SniDirect(ip) => write!(f, "SNI_DIRECT/{}", ip),
            Outcome::ConnFail(ip) => write!(f, "CONN_FAIL/{}", ip),
            Outcome::DnsFail(Some(err)) => write!(f, "DNS_FAIL/{}", err),
            Outcome::DnsFail(None) => write!(f, "DNS_FAIL/NONE"),
            Outcome::HttpDirect(method) => write!(f, "HTTP_DIRECT/{}", method),
            Outcome::HttpFail(reason) => write!(f, "HTTP_FAIL/{}", reason),
        }
    }
}

/// One access log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub client_ip: IpAddr,
    pub status: u16,
    pub event: Event,
    pub connection_id: String,
    pub target: String,
    pub outcome: Outcome,
}

impl fmt::Display for AccessEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {:<7} {} {} - {}",
            self.client_ip,
            self.outcome.protocol(),
            self.status,
            self.event.as_str(),
            self.connection_id,
            self.target,
            self.outcome
        )
    }
}

/// Destination for access log lines.
pub trait AccessLog: Send + Sync {
    fn record(&self, entry: &AccessEntry);
}

/// Writes access lines through `tracing` under the `access` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, entry: &AccessEntry) {
        info!(
            target: "access",
            connection_id = %entry.connection_id,
            "{}",
            entry
        );
    }
}
