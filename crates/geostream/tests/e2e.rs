//! End-to-end test against a real local WebSocket server
//!
//! Exercises the full pipeline without hardware:
//!
//! - push-style camera + location sources → Session → Transport → tokio-tungstenite server
//! - server hang-up → reconnect → exhausted retries once the server is gone
//! - on-disk backup of every accepted frame
//!
//! Run: `cargo test -p geostream --test e2e`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use geostream::backup::BackupConfig;
use geostream::capture::{ChannelFrameSource, ChannelLocationSource, LocationEvent};
use geostream::config::{AppConfig, ConfigStore, CONFIG_FILE};
use geostream::payload;
use geostream::session::{Session, SessionConfig};
use geostream::transport::{ConnectionState, LogKind, Transport, TransportConfig};
use geostream::{LocationFix, RawFrame, TransportError};

// ── Helpers ──────────────────────────────────────────────────────────

/// Accept one client, forward its text messages, then hang up and stop
/// listening when `hang_up` fires.
async fn spawn_server() -> (SocketAddr, mpsc::UnboundedReceiver<String>, mpsc::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (hang_up_tx, mut hang_up_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Refuse further connections from here on
        drop(listener);
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        loop {
            tokio::select! {
                _ = hang_up_rx.recv() => {
                    let _ = ws.close(None).await;
                    break;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = msg_tx.send(text.to_string());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
    });

    (addr, msg_rx, hang_up_tx)
}

fn rgb_frame() -> RawFrame {
    let (w, h) = (32u32, 24u32);
    let pixels: Vec<u8> = (0..w * h)
        .flat_map(|i| [(i % 256) as u8, 128, 64])
        .collect();
    RawFrame::rgb(w, h, pixels)
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn streams_reconnects_and_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, mut server_rx, hang_up) = spawn_server().await;

    let app = AppConfig {
        endpoint: format!("ws://{}/ws", addr),
        ..Default::default()
    };
    let store = Arc::new(ConfigStore::with_config(dir.path().join(CONFIG_FILE), app).unwrap());

    let transport = Transport::websocket(TransportConfig {
        connect_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(100),
        max_backoff: Duration::from_millis(200),
        ..Default::default()
    });

    let frames = ChannelFrameSource::new(8);
    let locations = ChannelLocationSource::new(8);
    let frame_pusher = frames.pusher();
    let location_pusher = locations.pusher();

    let config = SessionConfig {
        backup: Some(BackupConfig {
            root: dir.path().join("StreamBackup"),
            ..Default::default()
        }),
        settle_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let mut session = Session::new(
        config,
        store,
        transport.clone(),
        Box::new(frames),
        Box::new(locations),
    )
    .unwrap();

    session.start().await;
    assert!(location_pusher.push(LocationEvent::Fix(LocationFix::new(12.34, 56.78, 5.0))));
    assert!(
        wait_until(Duration::from_secs(5), || {
            let s = session.status();
            s.is_connected && s.location.is_fresh()
        })
        .await,
        "session never connected"
    );

    // 20 Hz camera for one second against a 5 Hz cap
    for _ in 0..20 {
        frame_pusher.push(rgb_frame());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let accepted = session.status().sampler.frames_accepted;
    assert!((4..=6).contains(&accepted), "accepted {} frames", accepted);

    let mut received = Vec::new();
    while (received.len() as u64) < accepted {
        let text = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .expect("server timed out waiting for messages")
            .expect("server closed");
        received.push(payload::decode(text.as_bytes()).unwrap());
    }

    for msg in &received {
        assert_eq!(msg.latitude, 12.34);
        assert_eq!(msg.longitude, 56.78);
        assert_eq!(msg.accuracy, 5.0);
        assert_eq!(&msg.jpeg[..2], &[0xFF, 0xD8]);
    }
    for pair in received.windows(2) {
        assert!(pair[0].captured_at < pair[1].captured_at);
    }

    // Server hangs up and stops listening
    hang_up.send(()).await.unwrap();
    let mut status = transport.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s.state, ConnectionState::Reconnecting { attempt: 1, .. })),
    )
    .await
    .expect("never entered reconnecting")
    .unwrap();

    tokio::time::timeout(
        Duration::from_secs(15),
        status.wait_for(|s| {
            s.state == ConnectionState::Disconnected
                && s.last_error == Some(TransportError::MaxRetriesExceeded { attempts: 8 })
        }),
    )
    .await
    .expect("never gave up")
    .unwrap();

    let logs = session.status().logs;
    assert!(logs.iter().any(|e| e.kind == LogKind::MaxRetries));

    // Every accepted frame is on disk, regardless of transmission
    assert!(
        wait_until(Duration::from_secs(5), || session.status().backups_saved == accepted).await
    );
    let backup = session.backup().unwrap().clone();
    let keys = backup.list_entries().unwrap();
    assert_eq!(keys.len() as u64, accepted);
    let meta = backup.read_metadata(&keys[0]).unwrap();
    assert_eq!((meta.lat, meta.lon), (12.34, 56.78));

    session.stop().await;
    assert!(!session.is_running());
}

#[tokio::test]
async fn unreachable_endpoint_still_backs_up() {
    let dir = tempfile::tempdir().unwrap();

    // Bind and immediately release a port so nothing listens there
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let app = AppConfig {
        endpoint: format!("ws://{}/ws", addr),
        ..Default::default()
    };
    let store = Arc::new(ConfigStore::with_config(dir.path().join(CONFIG_FILE), app).unwrap());
    let transport = Transport::websocket(TransportConfig::default());

    let frames = ChannelFrameSource::new(8);
    let frame_pusher = frames.pusher();
    let config = SessionConfig {
        backup: Some(BackupConfig {
            root: dir.path().join("StreamBackup"),
            ..Default::default()
        }),
        settle_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let mut session = Session::new(
        config,
        store,
        transport,
        Box::new(frames),
        Box::new(ChannelLocationSource::new(8)),
    )
    .unwrap();

    session.start().await;
    assert!(frame_pusher.push(rgb_frame()));
    assert!(
        wait_until(Duration::from_secs(5), || {
            let s = session.status();
            s.backups_saved == 1 && s.last_error.is_some()
        })
        .await
    );

    let status = session.status();
    assert!(!status.is_connected);
    assert_eq!(status.transport.messages_sent, 0);

    session.stop().await;
}
