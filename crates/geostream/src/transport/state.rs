//! Connection state and status snapshots

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Endpoint;
use crate::error::TransportError;

/// The single connection state, mutated only by the transport actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before retry number `attempt`
    Reconnecting { attempt: u32, next_retry_at: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting {
                attempt,
                next_retry_at,
            } => {
                let wait = next_retry_at.saturating_duration_since(Instant::now());
                write!(f, "reconnecting (attempt {}, in {:.1}s)", attempt, wait.as_secs_f64())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Reconnect delay before retry `attempt` (1-based): `min(base * 2^attempt, max)`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(31)).min(max)
}

/// Published by the actor after every transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub state: ConnectionState,
    /// Consecutive failures in the current cycle (0 once connected)
    pub attempt: u32,
    pub last_error: Option<TransportError>,
    /// Endpoint of the current or last connection cycle
    pub endpoint: Option<Endpoint>,
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
            endpoint: None,
        }
    }
}

/// Transport counters (returned as a snapshot from atomic counters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages written to the socket
    pub messages_sent: u64,
    pub bytes_sent: u64,
    /// `send` calls refused because the state was not `Connected`
    pub messages_rejected: u64,
    /// Messages discarded because the outbound queue was full or the
    /// connection dropped before they were written
    pub messages_dropped: u64,
    pub send_failures: u64,
    pub messages_received: u64,
}

/// Lock-free counters shared by the handle and the actor
#[derive(Debug, Default)]
pub(crate) struct AtomicTransportStats {
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub send_failures: AtomicU64,
    pub messages_received: AtomicU64,
}

impl AtomicTransportStats {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}
