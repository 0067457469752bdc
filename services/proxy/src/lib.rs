pub mod access_log;
pub mod config;
pub mod error;
pub mod proxy;

pub use access_log::{AccessEntry, AccessLog, Event, Outcome, TracingAccessLog};
pub use config::{Config, LogFormat};
pub use error::ProxyError;
pub use proxy::{
    Dialer, Listener, ListenerConfig, ListenerStats, PeekReader, Resolve, SessionHandler, Sniff,
    SniResult, SystemResolver, TunnelStats,
};
