//! Orchestrator: lifecycle wiring for the capture pipeline
//!
//! `start`: location source, transport connect, settle delay, camera capture.
//! `stop`: camera capture, transport disconnect, location source.
//!
//! Every accepted frame goes to two independent consumers, the transport
//! (`send`, never blocks) and the backup worker (`submit`, never blocks).

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::backup::{spawn_sweeper, BackupCache, BackupConfig, BackupWorker};
use crate::capture::{
    FrameRateTracker, FrameSource, LocationEvent, LocationSource, LocationTracker, Sampler,
    SamplerConfig, SamplerStats,
};
use crate::config::{ConfigStore, Endpoint};
use crate::error::{ConfigError, EncodeError, StorageError, TransportError};
use crate::payload;
use crate::transport::{ConnectionState, LogEntry, Transport, TransportStats};
use crate::{LocationSample, RawFrame, DEFAULT_SETTLE_DELAY};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sampler: SamplerConfig,
    /// `None` disables the local backup
    pub backup: Option<BackupConfig>,
    /// Delay between starting location and starting capture
    pub settle_delay: Duration,
    /// Window for the fps estimate
    pub fps_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            backup: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            fps_window: Duration::from_secs(3),
        }
    }
}

/// Everything a UI needs to render, as one snapshot
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub capturing: bool,
    pub is_connected: bool,
    pub connection: ConnectionState,
    pub attempt: u32,
    pub last_error: Option<TransportError>,
    pub endpoint: Endpoint,
    /// Accepted frames per second
    pub fps: f64,
    pub location: LocationSample,
    pub sampler: SamplerStats,
    pub transport: TransportStats,
    pub backups_saved: u64,
    /// Transport log, newest first
    pub logs: Vec<LogEntry>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    backup: Option<Arc<BackupWorker>>,
}

pub struct Session {
    config: SessionConfig,
    store: Arc<ConfigStore>,
    transport: Transport,
    sampler: Arc<Sampler>,
    backup: Option<Arc<BackupCache>>,
    frame_source: Box<dyn FrameSource>,
    location_source: Box<dyn LocationSource>,
    fps: Arc<Mutex<FrameRateTracker>>,
    running: Option<Running>,
    /// Backups saved by earlier runs
    backups_saved: u64,
}

impl Session {
    /// Build a session from persisted settings with a WebSocket transport
    pub fn from_store(
        store: Arc<ConfigStore>,
        frame_source: Box<dyn FrameSource>,
        location_source: Box<dyn LocationSource>,
    ) -> Result<Self, crate::Error> {
        let app = store.config();
        let backup = if app.backup.enabled {
            Some(app.backup_config()?)
        } else {
            None
        };
        let config = SessionConfig {
            sampler: app.sampler_config(),
            backup,
            ..Default::default()
        };
        let transport = Transport::websocket(app.transport_config());
        Self::new(config, store, transport, frame_source, location_source).map_err(Into::into)
    }

    /// Assemble a session from parts. Must be called within a tokio runtime.
    pub fn new(
        config: SessionConfig,
        store: Arc<ConfigStore>,
        transport: Transport,
        frame_source: Box<dyn FrameSource>,
        location_source: Box<dyn LocationSource>,
    ) -> Result<Self, StorageError> {
        let backup = match &config.backup {
            Some(b) => Some(Arc::new(BackupCache::open(&b.root, b.retention)?)),
            None => None,
        };
        let sampler = Arc::new(Sampler::new(
            config.sampler.clone(),
            Arc::new(LocationTracker::new()),
        ));
        let fps = Arc::new(Mutex::new(FrameRateTracker::new(config.fps_window)));

        Ok(Self {
            config,
            store,
            transport,
            sampler,
            backup,
            frame_source,
            location_source,
            fps,
            running: None,
            backups_saved: 0,
        })
    }

    /// Bring the pipeline up. No-op if already running.
    pub async fn start(&mut self) {
        if self.running.is_some() {
            debug!("Session already running");
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        // Location first, so the first frames carry a position
        let location_rx = self.location_source.start();
        tracker.spawn(pump_locations(location_rx, self.sampler.clone(), cancel.clone()));

        let endpoint = self.store.endpoint();
        info!(endpoint = %endpoint, "Starting session");
        self.transport.connect(endpoint).await;
        tracker.spawn(watch_endpoint(self.store.clone(), cancel.clone()));

        let backup = match &self.backup {
            Some(cache) => {
                let capacity = self
                    .config
                    .backup
                    .as_ref()
                    .map(|b| b.queue_capacity)
                    .unwrap_or(16);
                let interval = self
                    .config
                    .backup
                    .as_ref()
                    .map(|b| b.sweep_interval)
                    .unwrap_or(crate::DEFAULT_SWEEP_INTERVAL);
                let (worker, handle) = BackupWorker::spawn(cache.clone(), capacity);
                tracker.spawn(async move {
                    if let Err(e) = handle.await {
                        warn!(error = %e, "Backup worker ended abnormally");
                    }
                });
                let sweeper = spawn_sweeper(cache.clone(), interval, cancel.clone());
                tracker.spawn(async move {
                    let _ = sweeper.await;
                });
                Some(Arc::new(worker))
            }
            None => None,
        };

        tokio::time::sleep(self.config.settle_delay).await;

        self.sampler.reset();
        self.fps.lock().reset();
        let frame_rx = self.frame_source.start();
        tracker.spawn(pump_frames(
            frame_rx,
            FramePump {
                sampler: self.sampler.clone(),
                transport: self.transport.clone(),
                backup: backup.clone(),
                fps: self.fps.clone(),
            },
            cancel.clone(),
        ));

        self.running = Some(Running {
            cancel,
            tracker,
            backup,
        });
        info!("Capture started");
    }

    /// Tear the pipeline down in reverse order. No-op if not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Session not running");
            return;
        };

        self.frame_source.stop();
        self.transport.disconnect().await;
        self.location_source.stop();

        running.cancel.cancel();
        // The backup worker drains and exits once its last handle is gone
        let saved = running.backup.map(|worker| worker.saved_counter());
        running.tracker.close();
        if tokio::time::timeout(Duration::from_secs(5), running.tracker.wait())
            .await
            .is_err()
        {
            warn!("Session shutdown timed out after 5s, some tasks may not have finished");
        }
        if let Some(saved) = saved {
            self.backups_saved += saved.load(Ordering::Relaxed);
        }
        info!("Session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Explicit user retry, e.g. after `MaxRetriesExceeded`. Uses the
    /// current endpoint setting.
    pub async fn reconnect(&self) {
        self.transport.connect(self.store.endpoint()).await;
    }

    /// Change the endpoint. Takes effect on the next connect.
    pub fn set_endpoint(&self, url: &str) -> Result<Endpoint, ConfigError> {
        self.store.set_endpoint(url)
    }

    /// Feed a location event directly (bypassing the location source)
    pub fn update_location(&self, event: LocationEvent) -> bool {
        self.sampler.update_location(event)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn backup(&self) -> Option<&Arc<BackupCache>> {
        self.backup.as_ref()
    }

    fn running_backups_saved(&self) -> u64 {
        self.running
            .as_ref()
            .and_then(|r| r.backup.as_ref())
            .map(|w| w.saved())
            .unwrap_or(0)
    }

    pub fn status(&self) -> SessionStatus {
        let transport = self.transport.status();
        SessionStatus {
            capturing: self.running.is_some(),
            is_connected: transport.is_connected(),
            connection: transport.state,
            attempt: transport.attempt,
            last_error: transport.last_error,
            endpoint: self.store.endpoint(),
            fps: self.fps.lock().fps_at(Instant::now()),
            location: self.sampler.location(),
            sampler: self.sampler.stats(),
            transport: self.transport.stats(),
            backups_saved: self.backups_saved + self.running_backups_saved(),
            logs: self.transport.logs(),
        }
    }
}

// ========== Pumps ==========

struct FramePump {
    sampler: Arc<Sampler>,
    transport: Transport,
    backup: Option<Arc<BackupWorker>>,
    fps: Arc<Mutex<FrameRateTracker>>,
}

impl FramePump {
    async fn handle(&self, raw: RawFrame) {
        let now = Instant::now();
        let wall = Utc::now();
        if !self.sampler.admit(now) {
            return;
        }

        // JPEG and base64 encoding stay off the async workers
        let sampler = self.sampler.clone();
        let work = tokio::task::spawn_blocking(move || {
            let frame = sampler.compress_admitted(raw, now, wall)?;
            let location = sampler.location();
            let msg = payload::encode(&frame, &location);
            Ok::<_, EncodeError>((frame, location, msg))
        });
        let (frame, location, msg) = match work.await {
            Ok(Ok(encoded)) => encoded,
            Ok(Err(e)) => {
                warn!(error = %e, "Dropping frame that failed to compress");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Frame compression task failed");
                return;
            }
        };
        self.fps.lock().record(frame.monotonic);

        match msg {
            Ok(msg) => {
                if !self.transport.send(&msg) {
                    debug!(sequence = frame.sequence, "Frame not transmitted");
                }
            }
            Err(e) => warn!(sequence = frame.sequence, error = %e, "Failed to encode frame"),
        }

        if let Some(backup) = &self.backup {
            backup.submit(frame, location);
        }
    }
}

async fn pump_frames(mut rx: mpsc::Receiver<RawFrame>, pump: FramePump, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            raw = rx.recv() => match raw {
                Some(raw) => pump.handle(raw).await,
                None => {
                    debug!("Frame source closed");
                    break;
                }
            },
        }
    }
}

async fn pump_locations(
    mut rx: mpsc::Receiver<LocationEvent>,
    sampler: Arc<Sampler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    sampler.update_location(event);
                }
                None => {
                    debug!("Location source closed");
                    break;
                }
            },
        }
    }
}

async fn watch_endpoint(store: Arc<ConfigStore>, cancel: CancellationToken) {
    let mut rx = store.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let endpoint = rx.borrow_and_update().clone();
                info!(endpoint = %endpoint, "Endpoint changed, applies on next connect");
            }
        }
    }
}
