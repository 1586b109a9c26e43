//! In-memory connector driven by the test, for deterministic state machine tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::link::{Connector, Inbound, Link, Outbound};
use crate::config::Endpoint;
use crate::error::TransportError;

#[derive(Default)]
struct Script {
    /// Outcome of upcoming connects; empty means `default_ok`
    outcomes: VecDeque<bool>,
    default_ok: bool,
    connect_delay: Option<Duration>,
    connect_times: Vec<Instant>,
    endpoints: Vec<String>,
    sent: Vec<Outbound>,
    pings: u32,
    auto_pong: bool,
    stall_sends: bool,
    peer: Option<mpsc::UnboundedSender<Option<Result<Inbound, TransportError>>>>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    /// Every connect succeeds and pings are answered
    pub fn healthy() -> Self {
        let connector = Self::default();
        {
            let mut s = connector.script.lock();
            s.default_ok = true;
            s.auto_pong = true;
        }
        connector
    }

    /// Every connect fails
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn push_outcomes(&self, outcomes: &[bool]) {
        self.script.lock().outcomes.extend(outcomes.iter().copied());
    }

    pub fn set_default_ok(&self, ok: bool) {
        self.script.lock().default_ok = ok;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().connect_delay = Some(delay);
    }

    pub fn set_auto_pong(&self, on: bool) {
        self.script.lock().auto_pong = on;
    }

    pub fn set_stall_sends(&self, on: bool) {
        self.script.lock().stall_sends = on;
    }

    pub fn connects(&self) -> usize {
        self.script.lock().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.script.lock().connect_times.clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.script.lock().endpoints.clone()
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.script.lock().sent.clone()
    }

    pub fn pings(&self) -> u32 {
        self.script.lock().pings
    }

    /// Deliver an inbound item (or an error) on the live link
    pub fn inject(&self, item: Result<Inbound, TransportError>) {
        if let Some(peer) = self.script.lock().peer.as_ref() {
            let _ = peer.send(Some(item));
        }
    }

    /// Make the live link report end-of-stream
    pub fn hang_up(&self) {
        if let Some(peer) = self.script.lock().peer.take() {
            let _ = peer.send(None);
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Link = ScriptedLink;

    async fn connect(&self, endpoint: &Endpoint) -> Result<ScriptedLink, TransportError> {
        let (ok, delay) = {
            let mut s = self.script.lock();
            s.connect_times.push(Instant::now());
            s.endpoints.push(endpoint.to_string());
            let ok = s.outcomes.pop_front().unwrap_or(s.default_ok);
            (ok, s.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !ok {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().peer = Some(tx.clone());
        Ok(ScriptedLink {
            script: self.script.clone(),
            inbound: rx,
            own: tx,
        })
    }
}

pub(crate) struct ScriptedLink {
    script: Arc<Mutex<Script>>,
    inbound: mpsc::UnboundedReceiver<Option<Result<Inbound, TransportError>>>,
    own: mpsc::UnboundedSender<Option<Result<Inbound, TransportError>>>,
}

#[async_trait]
impl Link for ScriptedLink {
    async fn send(&mut self, payload: Outbound) -> Result<(), TransportError> {
        let stall = self.script.lock().stall_sends;
        if stall {
            pending::<()>().await;
        }
        self.script.lock().sent.push(payload);
        Ok(())
    }

    async fn ping(&mut self, _payload: Bytes) -> Result<(), TransportError> {
        let auto_pong = {
            let mut s = self.script.lock();
            s.pings += 1;
            s.auto_pong
        };
        if auto_pong {
            let _ = self.own.send(Some(Ok(Inbound::Pong)));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.inbound.recv().await.flatten()
    }

    async fn close(&mut self) {
        self.script.lock().peer = None;
    }
}
