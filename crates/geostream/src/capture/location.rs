//! Location tracking
//!
//! [`LocationTracker`] holds the single current [`LocationSample`], updated in
//! place from [`LocationEvent`]s. Sources push events through an mpsc channel:
//!
//! - [`GpsdLocationSource`]: TPV reports from a local gpsd daemon
//! - [`StaticLocationSource`]: one fixed fix, for benches without GPS
//! - `ChannelLocationSource` (see `source`): platform callbacks

use parking_lot::RwLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{LocationFix, LocationSample};

/// Default gpsd address
pub const GPSD_ADDR: &str = "127.0.0.1:2947";

/// An inbound location event from a platform provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationEvent {
    /// A new position fix
    Fix(LocationFix),
    /// The user granted (`true`) or revoked (`false`) location access
    Authorization(bool),
}

/// A push-style provider of location events.
///
/// `start` must be called from within a tokio runtime. Events from one source
/// arrive in order on the returned receiver; the receiver closes when the
/// source stops.
pub trait LocationSource: Send {
    fn start(&mut self) -> mpsc::Receiver<LocationEvent>;
    fn stop(&mut self);
}

/// Owner of the current location sample.
///
/// Writes come from the location delivery context, reads from the capture
/// path; neither ever blocks for long.
#[derive(Debug, Default)]
pub struct LocationTracker {
    current: RwLock<LocationSample>,
}

impl LocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event. Returns true if the sample changed.
    pub fn apply(&self, event: LocationEvent) -> bool {
        let mut current = self.current.write();
        match event {
            LocationEvent::Fix(fix) => {
                if !current.authorized {
                    debug!("Ignoring fix while location access is revoked");
                    return false;
                }
                if !fix.is_valid() {
                    debug!(
                        lat = fix.latitude,
                        lon = fix.longitude,
                        accuracy = fix.accuracy,
                        "Ignoring invalid fix"
                    );
                    return false;
                }
                current.latitude = fix.latitude;
                current.longitude = fix.longitude;
                current.accuracy = fix.accuracy;
                current.updated_at = Some(fix.timestamp);
                true
            }
            LocationEvent::Authorization(granted) => {
                if current.authorized == granted {
                    return false;
                }
                current.authorized = granted;
                if granted {
                    // Last-known values stay stale until a new fix arrives
                    current.updated_at = None;
                    info!("Location access granted");
                } else {
                    warn!("Location access revoked, last known position is stale");
                }
                true
            }
        }
    }

    pub fn snapshot(&self) -> LocationSample {
        *self.current.read()
    }
}

// ========== gpsd ==========

/// Reads fixes from a gpsd daemon over its JSON protocol.
///
/// If gpsd is not reachable the source yields nothing; the rest of the
/// pipeline keeps running with the default (never-fresh) location.
pub struct GpsdLocationSource {
    addr: String,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl GpsdLocationSource {
    pub fn new() -> Self {
        Self::with_addr(GPSD_ADDR)
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            shutdown_tx: None,
        }
    }
}

impl Default for GpsdLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource for GpsdLocationSource {
    fn start(&mut self) -> mpsc::Receiver<LocationEvent> {
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        let addr = self.addr.clone();

        tokio::spawn(async move {
            let stream = match TcpStream::connect(&addr).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "gpsd not available, GPS disabled");
                    return;
                }
            };
            debug!(addr = %addr, "Connected to gpsd");

            tokio::select! {
                result = gpsd_read_loop(stream, tx) => {
                    if let Err(e) = result {
                        debug!(error = %e, "gpsd reader ended");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("gpsd source shutdown requested");
                }
            }
        });

        rx
    }

    fn stop(&mut self) {
        self.shutdown_tx.take();
    }
}

impl Drop for GpsdLocationSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn gpsd_read_loop(stream: TcpStream, tx: mpsc::Sender<LocationEvent>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"?WATCH={\"enable\":true,\"json\":true}\n")
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(fix) = parse_gpsd_tpv(&line) {
            if tx.send(LocationEvent::Fix(fix)).await.is_err() {
                break;
            }
        }
    }
    Ok(())
}

/// Parse a gpsd TPV report into a fix.
///
/// Horizontal accuracy comes from `eph`, or the larger of `epx`/`epy` for
/// daemons that do not report `eph`. Reports without a 2D fix are skipped.
fn parse_gpsd_tpv(line: &str) -> Option<LocationFix> {
    let v: serde_json::Value = serde_json::from_str(line).ok()?;

    if v.get("class")?.as_str()? != "TPV" {
        return None;
    }

    // mode 0/1 = no fix
    if v.get("mode")?.as_u64()? < 2 {
        return None;
    }

    let lat = v.get("lat")?.as_f64()?;
    let lon = v.get("lon")?.as_f64()?;
    let field = |name: &str| v.get(name).and_then(|x| x.as_f64());
    let accuracy = field("eph")
        .or_else(|| match (field("epx"), field("epy")) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        })
        .unwrap_or(0.0);

    let mut fix = LocationFix::new(lat, lon, accuracy);
    if let Some(ts) = v
        .get("time")
        .and_then(|t| t.as_str())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
    {
        fix.timestamp = ts.with_timezone(&chrono::Utc);
    }
    Some(fix)
}

// ========== Static ==========

/// Emits one fixed position on start, then a refresh every `interval`
/// so `updated_at` keeps moving.
pub struct StaticLocationSource {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    interval: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl StaticLocationSource {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            interval: Duration::from_secs(1),
            shutdown_tx: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl LocationSource for StaticLocationSource {
    fn start(&mut self) -> mpsc::Receiver<LocationEvent> {
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        let (lat, lon, acc) = (self.latitude, self.longitude, self.accuracy);
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let fix = LocationFix::new(lat, lon, acc);
                        if tx.send(LocationEvent::Fix(fix)).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        rx
    }

    fn stop(&mut self) {
        self.shutdown_tx.take();
    }
}
