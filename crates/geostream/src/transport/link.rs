//! The seam between the state machine and the socket

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Endpoint;
use crate::error::TransportError;

/// A payload handed to the socket's write path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

impl Outbound {
    pub fn len(&self) -> usize {
        match self {
            Outbound::Text(s) => s.len(),
            Outbound::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something read from the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    /// Answer to a liveness probe
    Pong,
}

/// Opens links to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Link, TransportError>;
}

/// An open connection.
///
/// `recv` must be cancel-safe: the actor polls it inside `select!`.
#[async_trait]
pub trait Link: Send + 'static {
    async fn send(&mut self, payload: Outbound) -> Result<(), TransportError>;

    /// Send a liveness probe; the answer arrives as [`Inbound::Pong`]
    async fn ping(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Next inbound item; `None` once the connection is gone
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    /// Best-effort close handshake
    async fn close(&mut self);
}
