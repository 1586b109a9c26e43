//! Geostream Camera Binary
//!
//! Captures frames and GPS fixes and streams them as JSON over a WebSocket,
//! keeping a 7-day local backup of every transmitted frame.
//!
//! ## Usage
//!
//! ```bash
//! # Stream to the configured endpoint (gpsd for location)
//! geostream-camera
//!
//! # Persist a new endpoint and exit
//! geostream-camera --set-endpoint wss://example.com/ws
//!
//! # Fixed position instead of gpsd
//! GEOSTREAM_STATIC_LOCATION=12.34,56.78,5 geostream-camera
//!
//! # Inspect or prune the local backup
//! geostream-camera --list-backups
//! geostream-camera --sweep
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{info, warn};

use geostream::backup::BackupCache;
use geostream::capture::{
    GpsdLocationSource, LocationSource, StaticLocationSource, TestFrameSource,
};
use geostream::config::{AppConfig, ConfigStore};
use geostream::session::Session;

/// What to do this run
enum Mode {
    Stream,
    SetEndpoint(String),
    ListBackups,
    Sweep,
}

impl Mode {
    fn from_args() -> Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        match args.first().map(String::as_str) {
            None => Ok(Mode::Stream),
            Some("--set-endpoint") => {
                let url = args.get(1).context("--set-endpoint requires a URL")?;
                Ok(Mode::SetEndpoint(url.clone()))
            }
            Some("--list-backups") => Ok(Mode::ListBackups),
            Some("--sweep") => Ok(Mode::Sweep),
            Some(other) => anyhow::bail!("Unknown argument: {}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("geostream=info".parse()?),
        )
        .init();

    let mode = Mode::from_args()?;

    let path = AppConfig::default_path().context("Failed to locate settings")?;
    // GEOSTREAM_* overrides apply to this run only, never to the file
    let store = Arc::new(
        ConfigStore::open_with_env(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
    );
    let config = store.config();

    match mode {
        Mode::SetEndpoint(url) => {
            let endpoint = store.set_endpoint(&url).context("Endpoint rejected")?;
            info!("Endpoint set to {} ({})", endpoint, store.path().display());
            Ok(())
        }
        Mode::ListBackups => list_backups(&config),
        Mode::Sweep => sweep(&config),
        Mode::Stream => stream(store, &config).await,
    }
}

fn open_backup(config: &AppConfig) -> Result<BackupCache> {
    let backup = config.backup_config()?;
    BackupCache::open(&backup.root, backup.retention)
        .with_context(|| format!("Failed to open backup at {}", backup.root.display()))
}

fn list_backups(config: &AppConfig) -> Result<()> {
    let cache = open_backup(config)?;
    let entries = cache.entries()?;
    for entry in &entries {
        let created = entry
            .created
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match cache.read_metadata(&entry.key) {
            Ok(meta) => println!("{}  {:.6},{:.6}  created={}", entry.key, meta.lat, meta.lon, created),
            Err(e) => println!("{}  <{}>", entry.key, e),
        }
    }
    println!(
        "{} entries, {} bytes in {}",
        entries.len(),
        cache.usage_bytes(),
        cache.root().display()
    );
    Ok(())
}

fn sweep(config: &AppConfig) -> Result<()> {
    let cache = open_backup(config)?;
    let report = cache.sweep_expired();
    println!(
        "Removed {} expired entries, kept {}, {} failed",
        report.removed.len(),
        report.kept,
        report.failed
    );
    Ok(())
}

async fn stream(store: Arc<ConfigStore>, config: &AppConfig) -> Result<()> {
    let frames = TestFrameSource::new(config.test_source_config());
    let location: Box<dyn LocationSource> = match config.static_location() {
        Some((lat, lon, acc)) => {
            info!("Using static location {:.6},{:.6} (±{}m)", lat, lon, acc);
            Box::new(StaticLocationSource::new(lat, lon, acc))
        }
        None => {
            if config.capture.static_location.is_some() {
                warn!("Ignoring malformed static location, using gpsd");
            }
            Box::new(GpsdLocationSource::new())
        }
    };

    let mut session = Session::from_store(store, Box::new(frames), location)
        .context("Failed to set up session")?;
    session.start().await;

    let mut stats = tokio::time::interval(Duration::from_secs(5));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = stats.tick() => {
                let s = session.status();
                info!(
                    state = %s.connection,
                    fps = s.fps,
                    sent = s.transport.messages_sent,
                    rejected = s.transport.messages_rejected,
                    backed_up = s.backups_saved,
                    location_fresh = s.location.is_fresh(),
                    "Status"
                );
                if let Some(err) = &s.last_error {
                    if !s.is_connected {
                        warn!(error = %err, "Not connected");
                    }
                }
            }
        }
    }

    session.stop().await;
    session.transport().shutdown().await;
    Ok(())
}
