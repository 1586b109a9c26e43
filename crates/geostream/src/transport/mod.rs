//! Transport: one persistent connection to one endpoint
//!
//! A single actor task owns the socket, the [`ConnectionState`], the retry
//! counter and the event log. Callers hold a cheap [`Transport`] handle:
//!
//! - `connect` / `disconnect` / `shutdown` go over a control channel and are
//!   acknowledged once the actor has applied them
//! - `send` is synchronous and best-effort: it checks the published state and
//!   hands the payload to a small bounded queue, or returns `false`
//! - state and the log are read as snapshots, never awaited
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                 │ read / send / probe failure
//!      │ attempts exhausted     │ failure         ▼
//!      └────────────────── Reconnecting ◄─────────┘
//!                          (delay = min(2^n s, 60 s))
//! ```

mod actor;
mod link;
mod log;
mod state;
mod websocket;

#[cfg(test)]
pub(crate) mod scripted;

pub use actor::Transport;
pub use link::{Connector, Inbound, Link, Outbound};
pub use log::{EventLog, LogEntry, LogKind, LogLevel};
pub use state::{backoff_delay, ConnectionState, TransportStats, TransportStatus};
pub use websocket::{WsConnector, WsLink};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOG_CAPACITY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
    DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT, DEFAULT_SEND_TIMEOUT,
};

/// WebSocket frame type used for wire messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Text,
    Binary,
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keepalive ping period while connected
    pub probe_interval: Duration,
    /// Time allowed for a pong after each ping
    pub probe_timeout: Duration,
    /// Socket handshake budget
    pub connect_timeout: Duration,
    /// Per-message write budget
    pub send_timeout: Duration,
    /// Failed reconnects allowed before `MaxRetriesExceeded`
    pub max_attempts: u32,
    /// Backoff unit: attempt `n` waits `backoff_base * 2^n`
    pub backoff_base: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Log entries kept (newest first)
    pub log_capacity: usize,
    /// Outbound queue depth; `send` fails when full
    pub queue_capacity: usize,
    pub wire_format: WireFormat,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            max_backoff: DEFAULT_MAX_BACKOFF,
            log_capacity: DEFAULT_LOG_CAPACITY,
            queue_capacity: 8,
            wire_format: WireFormat::Text,
        }
    }
}
