//! Transport handle and the actor task behind it

use bytes::Bytes;
use parking_lot::Mutex;
use std::future::{pending, Future};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::debug;

use super::link::{Connector, Inbound, Link, Outbound};
use super::log::{EventLog, LogEntry, LogKind, LogLevel};
use super::state::{backoff_delay, AtomicTransportStats, ConnectionState, TransportStats, TransportStatus};
use super::websocket::WsConnector;
use super::{TransportConfig, WireFormat};
use crate::config::Endpoint;
use crate::error::TransportError;
use crate::payload::WireMessage;

/// Budget for the close handshake on an explicit disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A `Sent` log entry is written for the first message on a connection and
/// then once per this many
const SENT_LOG_EVERY: u64 = 50;

enum Control {
    Connect {
        endpoint: Endpoint,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the transport actor. Cheap to clone; the actor stops when the
/// last handle is dropped or on [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    control_tx: mpsc::Sender<Control>,
    data_tx: mpsc::Sender<Outbound>,
    status_rx: watch::Receiver<TransportStatus>,
    log: Arc<Mutex<EventLog>>,
    stats: Arc<AtomicTransportStats>,
    wire_format: WireFormat,
}

impl Transport {
    /// Spawn a WebSocket transport
    pub fn websocket(config: TransportConfig) -> Self {
        Self::spawn(WsConnector, config)
    }

    /// Spawn the actor with any connector. Must be called within a tokio runtime.
    pub fn spawn<C: Connector>(connector: C, config: TransportConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (data_tx, data_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(TransportStatus::default());
        let log = Arc::new(Mutex::new(EventLog::new(config.log_capacity)));
        let stats = Arc::new(AtomicTransportStats::default());
        let wire_format = config.wire_format;

        let actor = Actor {
            connector: Arc::new(connector),
            config,
            control_rx,
            data_rx,
            status_tx,
            log: log.clone(),
            stats: stats.clone(),
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
            endpoint: None,
            link: None,
            connecting: None,
            retry_at: None,
            next_probe_at: None,
            probe_deadline: None,
            probe_seq: 0,
            sent_on_link: 0,
        };
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Inner {
                control_tx,
                data_tx,
                status_rx,
                log,
                stats,
                wire_format,
            }),
        }
    }

    /// Start a connection cycle to `endpoint`.
    ///
    /// No-op while `Connecting` or `Connected`. While `Reconnecting`, the
    /// pending retry is replaced by an immediate attempt with a fresh counter.
    /// Returns once the actor has applied the command.
    pub async fn connect(&self, endpoint: Endpoint) {
        self.control(|ack| Control::Connect { endpoint, ack }).await;
    }

    /// Cancel any pending retry and probe, and close the socket.
    ///
    /// Once this returns no further connect attempt or probe will fire.
    pub async fn disconnect(&self) {
        self.control(|ack| Control::Disconnect { ack }).await;
    }

    /// Disconnect and stop the actor task
    pub async fn shutdown(&self) {
        self.control(|ack| Control::Shutdown { ack }).await;
    }

    async fn control(&self, make: impl FnOnce(oneshot::Sender<()>) -> Control) {
        let (ack, done) = oneshot::channel();
        if self.inner.control_tx.send(make(ack)).await.is_err() {
            debug!("Transport actor is gone, ignoring command");
            return;
        }
        let _ = done.await;
    }

    /// Best-effort, non-blocking send.
    ///
    /// Returns false without any socket I/O when not `Connected`, and false
    /// when the outbound queue is full. A `true` only means the message was
    /// handed to the write path; write failures show up in the log.
    pub fn send(&self, msg: &WireMessage) -> bool {
        if !self.is_connected() {
            AtomicTransportStats::incr(&self.inner.stats.messages_rejected, 1);
            return false;
        }

        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "Failed to serialize wire message");
                return false;
            }
        };
        let payload = match self.inner.wire_format {
            WireFormat::Text => Outbound::Text(json),
            WireFormat::Binary => Outbound::Binary(Bytes::from(json.into_bytes())),
        };

        match self.inner.data_tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                AtomicTransportStats::incr(&self.inner.stats.messages_dropped, 1);
                debug!("Outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status_rx.borrow().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status_rx.borrow().state
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status_rx.borrow().clone()
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status_rx.clone()
    }

    /// Log entries, newest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.log.lock().entries()
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}

// ========== Actor ==========

enum Event<L> {
    Control(Option<Control>),
    Connected(Result<L, TransportError>),
    Retry,
    Probe,
    ProbeExpired,
    Inbound(Option<Result<Inbound, TransportError>>),
    Outbound(Outbound),
}

struct Actor<C: Connector> {
    connector: Arc<C>,
    config: TransportConfig,
    control_rx: mpsc::Receiver<Control>,
    data_rx: mpsc::Receiver<Outbound>,
    status_tx: watch::Sender<TransportStatus>,
    log: Arc<Mutex<EventLog>>,
    stats: Arc<AtomicTransportStats>,

    state: ConnectionState,
    attempt: u32,
    last_error: Option<TransportError>,
    endpoint: Option<Endpoint>,
    link: Option<C::Link>,
    connecting: Option<JoinHandle<Result<C::Link, TransportError>>>,
    retry_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    probe_deadline: Option<Instant>,
    probe_seq: u64,
    sent_on_link: u64,
}

/// Socket I/O raced against the control channel
enum Raced<T> {
    Done(T),
    Interrupted(Option<Control>),
}

impl<C: Connector> Actor<C> {
    async fn run(mut self) {
        loop {
            let connected = self.link.is_some();
            let event = tokio::select! {
                biased;

                cmd = self.control_rx.recv() => Event::Control(cmd),
                result = join_connect(&mut self.connecting) => Event::Connected(result),
                _ = sleep_until_opt(self.retry_at) => Event::Retry,
                _ = sleep_until_opt(self.probe_deadline) => Event::ProbeExpired,
                _ = sleep_until_opt(self.next_probe_at) => Event::Probe,
                inbound = recv_opt(&mut self.link) => Event::Inbound(inbound),
                Some(payload) = self.data_rx.recv(), if connected => Event::Outbound(payload),
            };

            // Control commands, including ones that cut socket I/O short
            let control = match event {
                Event::Control(cmd) => Some(cmd),
                Event::Connected(result) => {
                    self.connecting = None;
                    match result {
                        Ok(link) => self.on_connected(link),
                        Err(e) => self.fail(e),
                    }
                    None
                }
                Event::Retry => {
                    self.retry_at = None;
                    if let Some(endpoint) = self.endpoint.clone() {
                        self.start_connect(endpoint);
                    }
                    None
                }
                Event::Probe => self.send_probe().await,
                Event::ProbeExpired => {
                    let waited = self.config.probe_timeout;
                    self.fail(TransportError::Probe(format!(
                        "no pong within {:.1}s",
                        waited.as_secs_f64()
                    )));
                    None
                }
                Event::Inbound(Some(Ok(inbound))) => {
                    self.on_inbound(inbound);
                    None
                }
                Event::Inbound(Some(Err(e))) => {
                    self.fail(e);
                    None
                }
                Event::Inbound(None) => {
                    self.fail(TransportError::Receive("connection closed".to_string()));
                    None
                }
                Event::Outbound(payload) => self.write(payload).await,
            };

            if let Some(cmd) = control {
                if self.on_control(cmd).await.is_break() {
                    break;
                }
            }
        }
        debug!("Transport actor stopped");
    }

    async fn on_control(&mut self, cmd: Option<Control>) -> ControlFlow<()> {
        match cmd {
            None => {
                debug!("All transport handles dropped, stopping");
                self.teardown().await;
                ControlFlow::Break(())
            }
            Some(Control::Connect { endpoint, ack }) => {
                self.handle_connect(endpoint);
                let _ = ack.send(());
                ControlFlow::Continue(())
            }
            Some(Control::Disconnect { ack }) => {
                self.handle_disconnect().await;
                let _ = ack.send(());
                ControlFlow::Continue(())
            }
            Some(Control::Shutdown { ack }) => {
                self.teardown().await;
                let _ = ack.send(());
                ControlFlow::Break(())
            }
        }
    }

    // ---------- transitions ----------

    fn handle_connect(&mut self, endpoint: Endpoint) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(state = self.state.name(), "connect() ignored");
            }
            ConnectionState::Reconnecting { .. } | ConnectionState::Disconnected => {
                self.retry_at = None;
                self.attempt = 0;
                self.start_connect(endpoint);
            }
        }
    }

    fn start_connect(&mut self, endpoint: Endpoint) {
        let connector = self.connector.clone();
        let target = endpoint.clone();
        let budget = self.config.connect_timeout;
        self.connecting = Some(tokio::spawn(async move {
            match timeout(budget, connector.connect(&target)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect(format!(
                    "handshake timed out after {:.0}s",
                    budget.as_secs_f64()
                ))),
            }
        }));

        let message = if self.attempt == 0 {
            format!("Connecting to {}", endpoint)
        } else {
            format!(
                "Reconnecting to {} (attempt {}/{})",
                endpoint, self.attempt, self.config.max_attempts
            )
        };
        self.log.lock().info(LogKind::State, message);
        self.endpoint = Some(endpoint);
        self.set_state(ConnectionState::Connecting);
    }

    fn on_connected(&mut self, link: C::Link) {
        self.link = Some(link);
        self.sent_on_link = 0;
        self.attempt = 0;
        self.next_probe_at = Some(Instant::now() + self.config.probe_interval);
        self.probe_deadline = None;
        let endpoint = self
            .endpoint
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        self.log
            .lock()
            .info(LogKind::State, format!("Connected to {}", endpoint));
        self.set_state(ConnectionState::Connected);
    }

    /// Any error while connecting or connected: drop the socket and either
    /// schedule the next retry or give up.
    fn fail(&mut self, error: TransportError) {
        self.link = None;
        self.next_probe_at = None;
        self.probe_deadline = None;
        self.drop_queued();

        self.log.lock().record(
            LogLevel::Warn,
            LogKind::Failure,
            format!("Connection failed while {}", self.state.name()),
            Some(error.clone()),
        );
        self.last_error = Some(error);
        self.attempt += 1;

        if self.attempt > self.config.max_attempts {
            let attempts = self.config.max_attempts;
            let error = TransportError::MaxRetriesExceeded { attempts };
            self.log.lock().record(
                LogLevel::Error,
                LogKind::MaxRetries,
                "Giving up on reconnecting; connect again to retry",
                Some(error.clone()),
            );
            self.attempt = attempts;
            self.last_error = Some(error);
            self.retry_at = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = backoff_delay(self.attempt, self.config.backoff_base, self.config.max_backoff);
        let next_retry_at = Instant::now() + delay;
        self.retry_at = Some(next_retry_at);
        self.log.lock().record(
            LogLevel::Warn,
            LogKind::State,
            format!(
                "Retrying in {:.1}s (attempt {}/{})",
                delay.as_secs_f64(),
                self.attempt,
                self.config.max_attempts
            ),
            None,
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
            next_retry_at,
        });
    }

    async fn handle_disconnect(&mut self) {
        let was = self.state;
        self.cancel_all().await;
        self.attempt = 0;
        if was != ConnectionState::Disconnected {
            self.log.lock().info(LogKind::State, "Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&mut self) {
        self.cancel_all().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Abort the in-flight connect, clear every timer and close the socket
    async fn cancel_all(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        self.retry_at = None;
        self.next_probe_at = None;
        self.probe_deadline = None;
        if let Some(mut link) = self.link.take() {
            if timeout(CLOSE_TIMEOUT, link.close()).await.is_err() {
                debug!("Close handshake timed out");
            }
        }
        self.drop_queued();
    }

    // ---------- connected-state work ----------

    /// Returns a control command that arrived while the ping was being written
    async fn send_probe(&mut self) -> Option<Option<Control>> {
        self.next_probe_at = Some(Instant::now() + self.config.probe_interval);
        if self.probe_deadline.is_some() {
            // Previous probe still outstanding; its deadline decides
            return None;
        }
        let link = self.link.as_mut()?;

        self.probe_seq += 1;
        let payload = Bytes::copy_from_slice(&self.probe_seq.to_be_bytes());
        let budget = self.config.send_timeout;
        let result = race_control(&mut self.control_rx, timeout(budget, link.ping(payload))).await;
        match result {
            Raced::Done(Ok(Ok(()))) => {
                self.probe_deadline = Some(Instant::now() + self.config.probe_timeout);
            }
            Raced::Done(Ok(Err(e))) => self.fail(e),
            Raced::Done(Err(_)) => {
                self.fail(TransportError::Probe("ping write timed out".to_string()))
            }
            Raced::Interrupted(cmd) => {
                self.abandon_link();
                return Some(cmd);
            }
        }
        None
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Pong => {
                self.probe_deadline = None;
            }
            Inbound::Text(text) => {
                AtomicTransportStats::incr(&self.stats.messages_received, 1);
                self.log.lock().info(
                    LogKind::Inbound,
                    format!("Received text message ({} bytes)", text.len()),
                );
            }
            Inbound::Binary(data) => {
                AtomicTransportStats::incr(&self.stats.messages_received, 1);
                self.log.lock().info(
                    LogKind::Inbound,
                    format!("Received binary message ({} bytes)", data.len()),
                );
            }
        }
    }

    /// Returns a control command that arrived while the write was in flight
    async fn write(&mut self, payload: Outbound) -> Option<Option<Control>> {
        let Some(link) = self.link.as_mut() else {
            AtomicTransportStats::incr(&self.stats.messages_dropped, 1);
            return None;
        };

        let len = payload.len() as u64;
        let budget = self.config.send_timeout;
        let result = race_control(&mut self.control_rx, timeout(budget, link.send(payload))).await;
        match result {
            Raced::Done(Ok(Ok(()))) => {
                AtomicTransportStats::incr(&self.stats.messages_sent, 1);
                AtomicTransportStats::incr(&self.stats.bytes_sent, len);
                self.sent_on_link += 1;
                if self.sent_on_link == 1 || self.sent_on_link % SENT_LOG_EVERY == 0 {
                    let total = self.stats.snapshot().messages_sent;
                    self.log.lock().info(
                        LogKind::Sent,
                        format!(
                            "Frame + GPS sent ({} on this connection, {} total)",
                            self.sent_on_link, total
                        ),
                    );
                }
            }
            Raced::Done(Ok(Err(e))) => {
                AtomicTransportStats::incr(&self.stats.send_failures, 1);
                self.fail(e);
            }
            Raced::Done(Err(_)) => {
                AtomicTransportStats::incr(&self.stats.send_failures, 1);
                self.fail(TransportError::Send(format!(
                    "write timed out after {:.0}s, connection likely dead",
                    budget.as_secs_f64()
                )));
            }
            Raced::Interrupted(cmd) => {
                AtomicTransportStats::incr(&self.stats.messages_dropped, 1);
                self.abandon_link();
                return Some(cmd);
            }
        }
        None
    }

    /// Drop a link whose write was cut short. No close handshake can be
    /// queued behind a partial frame.
    fn abandon_link(&mut self) {
        if self.link.take().is_some() {
            debug!("Abandoning socket with a write in flight");
        }
    }

    /// Discard messages queued for a connection that no longer exists
    fn drop_queued(&mut self) {
        let mut dropped = 0u64;
        while self.data_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            AtomicTransportStats::incr(&self.stats.messages_dropped, dropped);
            self.log.lock().record(
                LogLevel::Warn,
                LogKind::Dropped,
                format!("Dropped {} queued message(s)", dropped),
                None,
            );
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status_tx.send_replace(TransportStatus {
            state,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            endpoint: self.endpoint.clone(),
        });
    }
}

/// Await socket I/O while still serving control commands.
///
/// `connect` is acknowledged in place (it is a no-op while connected); any
/// other command, or the loss of every handle, cuts the I/O short.
async fn race_control<T>(
    control_rx: &mut mpsc::Receiver<Control>,
    io: impl Future<Output = T>,
) -> Raced<T> {
    tokio::pin!(io);
    loop {
        tokio::select! {
            biased;

            cmd = control_rx.recv() => match cmd {
                Some(Control::Connect { ack, .. }) => {
                    debug!("connect() ignored, already connected");
                    let _ = ack.send(());
                }
                other => return Raced::Interrupted(other),
            },
            out = &mut io => return Raced::Done(out),
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn recv_opt<L: Link>(link: &mut Option<L>) -> Option<Result<Inbound, TransportError>> {
    match link {
        Some(link) => link.recv().await,
        None => pending().await,
    }
}

async fn join_connect<L>(
    handle: &mut Option<JoinHandle<Result<L, TransportError>>>,
) -> Result<L, TransportError> {
    match handle {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Connect(format!("connect task failed: {}", e))),
        },
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedConnector;
    use crate::transport::LogKind;

    fn endpoint() -> Endpoint {
        Endpoint::parse("ws://127.0.0.1:8000/ws").unwrap()
    }

    fn message(n: u32) -> WireMessage {
        WireMessage {
            timestamp: format!("2024-05-01T12:00:00.{:03}Z", n),
            lat: 12.34,
            lon: 56.78,
            accuracy: 5.0,
            image: "/9j/".to_string(),
        }
    }

    async fn wait_for_state(
        transport: &Transport,
        pred: impl Fn(&ConnectionState) -> bool,
    ) -> TransportStatus {
        let mut rx = transport.subscribe();
        let status = rx.wait_for(|s| pred(&s.state)).await.unwrap().clone();
        status
    }

    async fn connected(connector: &ScriptedConnector) -> Transport {
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| s.is_connected()).await;
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_sends() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;

        for n in 0..3 {
            assert!(transport.send(&message(n)));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let sent = connector.sent();
        assert_eq!(sent.len(), 3);
        match &sent[0] {
            Outbound::Text(json) => {
                let decoded = WireMessage::from_json(json.as_bytes()).unwrap();
                assert_eq!(decoded, message(0));
            }
            other => panic!("expected text frame, got {:?}", other),
        }
        let stats = transport.stats();
        assert_eq!(stats.messages_sent, 3);
        assert!(stats.bytes_sent > 0);
        assert_eq!(transport.status().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_wire_format() {
        let connector = ScriptedConnector::healthy();
        let transport = Transport::spawn(
            connector.clone(),
            TransportConfig {
                wire_format: WireFormat::Binary,
                ..Default::default()
            },
        );
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| s.is_connected()).await;

        assert!(transport.send(&message(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(connector.sent()[0], Outbound::Binary(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_not_connected_fails_without_io() {
        let connector = ScriptedConnector::unreachable();
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());

        assert!(!transport.send(&message(0)));

        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert!(!transport.send(&message(1)));

        assert!(connector.sent().is_empty());
        assert_eq!(transport.stats().messages_rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_then_max_retries() {
        let connector = ScriptedConnector::unreachable();
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;

        let status = wait_for_state(&transport, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(status.attempt, 1);
        if let ConnectionState::Reconnecting { attempt, next_retry_at } = status.state {
            assert_eq!(attempt, 1);
            assert!(next_retry_at <= Instant::now() + Duration::from_secs(2));
        }

        // Give up only after the eighth retry fails
        let mut rx = transport.subscribe();
        rx.wait_for(|s| {
            s.state == ConnectionState::Disconnected
                && matches!(s.last_error, Some(TransportError::MaxRetriesExceeded { .. }))
        })
        .await
        .unwrap();

        let times = connector.connect_times();
        assert_eq!(times.len(), 9);
        let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![2, 4, 8, 16, 32, 60, 60, 60]);

        let status = transport.status();
        assert_eq!(status.attempt, 8);
        assert_eq!(
            status.last_error,
            Some(TransportError::MaxRetriesExceeded { attempts: 8 })
        );
        let latest = &transport.logs()[0];
        assert_eq!(latest.kind, LogKind::MaxRetries);
        assert_eq!(latest.level, LogLevel::Error);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.connects(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_resets_attempt_counter() {
        let connector = ScriptedConnector::unreachable();
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| matches!(s, ConnectionState::Reconnecting { attempt: 3, .. })).await;

        connector.set_default_ok(true);
        transport.connect(endpoint()).await;
        let status = wait_for_state(&transport, |s| s.is_connected()).await;
        assert_eq!(status.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let connector = ScriptedConnector::unreachable();
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_aborts_in_flight_connect() {
        let connector = ScriptedConnector::healthy();
        connector.set_connect_delay(Duration::from_secs(3));
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;
        assert_eq!(transport.state(), ConnectionState::Connecting);

        transport.disconnect().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(connector.connects() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_probes() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        let pings = connector.pings();
        assert_eq!(pings, 2);

        transport.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.pings(), pings);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_connected() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        transport.connect(endpoint()).await;
        transport.connect(Endpoint::parse("ws://10.0.0.1/ws").unwrap()).await;
        assert_eq!(connector.connects(), 1);
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_triggers_reconnect() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;

        connector.inject(Err(TransportError::Receive("connection reset".into())));
        let status = wait_for_state(&transport, |s| !s.is_connected()).await;
        assert!(matches!(status.state, ConnectionState::Reconnecting { attempt: 1, .. }));
        assert_eq!(
            status.last_error,
            Some(TransportError::Receive("connection reset".into()))
        );

        // Retry after 2s succeeds and resets the counter
        let status = wait_for_state(&transport, |s| s.is_connected()).await;
        assert_eq!(status.attempt, 0);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_hang_up_triggers_reconnect() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        connector.set_default_ok(false);
        connector.hang_up();

        let status = wait_for_state(&transport, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert!(matches!(status.last_error, Some(TransportError::Receive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_triggers_reconnect() {
        let connector = ScriptedConnector::healthy();
        connector.set_auto_pong(false);
        let transport = connected(&connector).await;
        let connected_at = Instant::now();

        let status = wait_for_state(&transport, |s| !s.is_connected()).await;
        assert!(matches!(status.last_error, Some(TransportError::Probe(_))));
        assert_eq!(connected_at.elapsed().as_secs(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_probes_keep_connection() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(transport.is_connected());
        assert!(connector.pings() >= 11);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_times_out() {
        let connector = ScriptedConnector::healthy();
        connector.set_stall_sends(true);
        let transport = connected(&connector).await;

        assert!(transport.send(&message(0)));
        let status = wait_for_state(&transport, |s| !s.is_connected()).await;
        assert!(matches!(status.last_error, Some(TransportError::Send(_))));
        assert_eq!(transport.stats().send_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cuts_stalled_write_short() {
        let connector = ScriptedConnector::healthy();
        connector.set_stall_sends(true);
        let transport = connected(&connector).await;

        assert!(transport.send(&message(0)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        transport.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(100));

        let status = transport.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.last_error, None);
        assert_eq!(transport.stats().messages_dropped, 1);
        assert_eq!(transport.stats().send_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_answered_during_stalled_write() {
        let connector = ScriptedConnector::healthy();
        connector.set_stall_sends(true);
        let transport = connected(&connector).await;

        assert!(transport.send(&message(0)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        transport.connect(endpoint()).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(transport.is_connected());
        assert_eq!(connector.connects(), 1);

        // The write still runs into its own timeout
        let status = wait_for_state(&transport, |s| !s.is_connected()).await;
        assert!(matches!(status.last_error, Some(TransportError::Send(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_logged_in_aggregate() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;

        for n in 0..60 {
            assert!(transport.send(&message(n)));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let sent: Vec<LogEntry> = transport
            .logs()
            .into_iter()
            .filter(|e| e.kind == LogKind::Sent)
            .collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].level, LogLevel::Info);
        assert!(sent[0].message.contains("50 on this connection"));
        assert!(sent[1].message.contains("1 on this connection"));
        assert_eq!(transport.stats().messages_sent, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_instead_of_blocking() {
        let connector = ScriptedConnector::healthy();
        connector.set_stall_sends(true);
        let transport = Transport::spawn(
            connector.clone(),
            TransportConfig {
                queue_capacity: 2,
                ..Default::default()
            },
        );
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| s.is_connected()).await;

        // First message is taken by the stalled writer, two more fill the queue
        let results: Vec<bool> = (0..6).map(|n| transport.send(&message(n))).collect();
        assert!(results.iter().filter(|ok| !**ok).count() >= 3);
        assert!(transport.stats().messages_dropped >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_are_logged() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        connector.inject(Ok(Inbound::Text("ack".into())));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(transport.stats().messages_received, 1);
        assert_eq!(transport.logs()[0].kind, LogKind::Inbound);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_use_endpoint_of_current_cycle() {
        let connector = ScriptedConnector::unreachable();
        connector.push_outcomes(&[false, true]);
        let transport = Transport::spawn(connector.clone(), TransportConfig::default());
        transport.connect(endpoint()).await;
        wait_for_state(&transport, |s| s.is_connected()).await;
        assert_eq!(
            connector.endpoints(),
            vec!["ws://127.0.0.1:8000/ws", "ws://127.0.0.1:8000/ws"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_actor() {
        let connector = ScriptedConnector::healthy();
        let transport = connected(&connector).await;
        transport.shutdown().await;
        assert!(!transport.is_connected());

        transport.connect(endpoint()).await;
        assert_eq!(connector.connects(), 1);
    }
}
