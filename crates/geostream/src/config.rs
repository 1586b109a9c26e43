//! Persisted settings
//!
//! `config.toml` lives in the platform config dir (`directories`), with
//! `GEOSTREAM_*` environment variables layered on top. The endpoint is the
//! only setting editable at runtime; [`ConfigStore`] validates it, persists
//! it and publishes it on a watch channel for the orchestrator.

use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, info};

use crate::backup::BackupConfig;
use crate::capture::{SamplerConfig, TestSourceConfig};
use crate::error::ConfigError;
use crate::transport::{TransportConfig, WireFormat};
use crate::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_ENDPOINT, DEFAULT_JPEG_QUALITY, DEFAULT_LOG_CAPACITY,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF, DEFAULT_MIN_FRAME_INTERVAL, DEFAULT_PROBE_INTERVAL,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_RETENTION, DEFAULT_SEND_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};

/// Config file name inside the config dir
pub const CONFIG_FILE: &str = "config.toml";

/// Backup directory name inside the data dir
pub const BACKUP_DIR: &str = "StreamBackup";

// ========== Endpoint ==========

/// A validated `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    /// Validate a URL. Rejected values never reach the socket layer.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if url.is_empty() {
            return Err(invalid("empty"));
        }
        let uri = url.parse::<Uri>().map_err(|e| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {:?}", other))),
            None => return Err(invalid("missing ws:// or wss:// scheme")),
        }
        match uri.host() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("missing host")),
        }

        Ok(Self {
            url: url.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

// ========== AppConfig ==========

/// Top-level settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server URL (`ws://` or `wss://`)
    pub endpoint: String,
    pub capture: CaptureSettings,
    pub transport: TransportSettings,
    pub backup: BackupSettings,
}

/// Frame sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Minimum spacing between transmitted frames, in milliseconds
    pub min_frame_interval_ms: u64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Test source resolution and camera rate
    pub width: u32,
    pub height: u32,
    pub source_fps: u32,
    /// Fixed position instead of gpsd, as `lat,lon[,accuracy]`
    pub static_location: Option<String>,
}

/// Connection behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub max_attempts: u32,
    pub max_backoff_secs: u64,
    pub log_capacity: usize,
    pub wire_format: WireFormat,
}

/// Local backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub enabled: bool,
    /// Backup root (defaults to `<data dir>/StreamBackup`)
    pub dir: Option<PathBuf>,
    pub retention_days: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            capture: CaptureSettings::default(),
            transport: TransportSettings::default(),
            backup: BackupSettings::default(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            min_frame_interval_ms: DEFAULT_MIN_FRAME_INTERVAL.as_millis() as u64,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            width: 640,
            height: 480,
            source_fps: 30,
            static_location: None,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: DEFAULT_PROBE_INTERVAL.as_secs(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            send_timeout_secs: DEFAULT_SEND_TIMEOUT.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF.as_secs(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            wire_format: WireFormat::Text,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            retention_days: DEFAULT_RETENTION.as_secs() / 86_400,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&contents)?;
        Endpoint::parse(&config.endpoint)?;
        Ok(config)
    }

    /// Load from a TOML file, or defaults if it does not exist yet
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Save to a TOML file, creating parent directories
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(write_err)?;
        Ok(())
    }

    /// `config.toml` in the platform config dir, or `GEOSTREAM_CONFIG`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var("GEOSTREAM_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    /// Layer `GEOSTREAM_*` variables, as returned by `var`, over the file values
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            var(key).and_then(|s| s.trim().parse().ok())
        }

        if let Some(endpoint) = var("GEOSTREAM_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(dir) = var("GEOSTREAM_BACKUP_DIR") {
            self.backup.dir = Some(PathBuf::from(dir));
        }
        if let Some(fps) = parsed::<f64>(&var, "GEOSTREAM_FPS") {
            if fps > 0.0 {
                self.capture.min_frame_interval_ms = (1000.0 / fps).round() as u64;
            }
        }
        if let Some(quality) = parsed(&var, "GEOSTREAM_JPEG_QUALITY") {
            self.capture.jpeg_quality = quality;
        }
        if let Some(fps) = parsed(&var, "GEOSTREAM_SOURCE_FPS") {
            self.capture.source_fps = fps;
        }
        if let Some(location) = var("GEOSTREAM_STATIC_LOCATION") {
            self.capture.static_location = Some(location);
        }
        if let Some(days) = parsed(&var, "GEOSTREAM_RETENTION_DAYS") {
            self.backup.retention_days = days;
        }
        if let Some(enabled) = var("GEOSTREAM_BACKUP") {
            self.backup.enabled = enabled != "0";
        }
        if let Some(format) = var("GEOSTREAM_WIRE_FORMAT") {
            match format.as_str() {
                "binary" => self.transport.wire_format = WireFormat::Binary,
                "text" => self.transport.wire_format = WireFormat::Text,
                other => debug!(value = other, "Ignoring unknown GEOSTREAM_WIRE_FORMAT"),
            }
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.endpoint)
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            min_frame_interval: Duration::from_millis(self.capture.min_frame_interval_ms),
            jpeg_quality: self.capture.jpeg_quality,
        }
    }

    pub fn test_source_config(&self) -> TestSourceConfig {
        TestSourceConfig {
            width: self.capture.width,
            height: self.capture.height,
            fps: self.capture.source_fps,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            probe_interval: Duration::from_secs(t.probe_interval_secs),
            probe_timeout: Duration::from_secs(t.probe_timeout_secs),
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            send_timeout: Duration::from_secs(t.send_timeout_secs),
            max_attempts: t.max_attempts,
            max_backoff: Duration::from_secs(t.max_backoff_secs),
            log_capacity: t.log_capacity,
            wire_format: t.wire_format,
            ..Default::default()
        }
    }

    /// Backup settings, resolving the default root from the data dir
    pub fn backup_config(&self) -> Result<BackupConfig, ConfigError> {
        let root = match &self.backup.dir {
            Some(dir) => dir.clone(),
            None => project_dirs()?.data_dir().join(BACKUP_DIR),
        };
        Ok(BackupConfig {
            root,
            retention: Duration::from_secs(self.backup.retention_days * 86_400),
            sweep_interval: Duration::from_secs(self.backup.sweep_interval_secs),
            ..Default::default()
        })
    }

    /// Parse `capture.static_location` as `lat,lon[,accuracy]`
    pub fn static_location(&self) -> Option<(f64, f64, f64)> {
        let raw = self.capture.static_location.as_deref()?;
        let parts: Vec<f64> = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [lat, lon] => Some((*lat, *lon, 0.0)),
            [lat, lon, acc] => Some((*lat, *lon, *acc)),
            _ => None,
        }
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("", "", "geostream").ok_or(ConfigError::NoProjectDirs)
}

// ========== ConfigStore ==========

/// Owner of the settings file and the runtime-mutable endpoint.
///
/// Endpoint changes are delivered on a watch channel; they take effect on
/// the next connect, never on an active connection.
///
/// Environment overrides only live in memory: the file keeps what was
/// loaded from it plus endpoint changes.
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<Layers>,
    endpoint_tx: watch::Sender<Endpoint>,
}

struct Layers {
    /// Contents of the settings file
    file: AppConfig,
    /// `file` with environment overrides applied
    effective: AppConfig,
}

impl ConfigStore {
    /// Load the settings file at `path` (defaults if missing)
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = AppConfig::load_or_default(&path)?;
        Self::with_config(path, config)
    }

    /// Load the settings file at `path` and layer `GEOSTREAM_*` variables
    /// over it for this run
    pub fn open_with_env(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::open_with_overrides(path, |key| std::env::var(key).ok())
    }

    fn open_with_overrides(
        path: impl Into<PathBuf>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = AppConfig::load_or_default(&path)?;
        let mut effective = file.clone();
        effective.apply_overrides(var);
        Self::layered(path, file, effective)
    }

    /// Use an already-loaded config, persisting changes to `path`
    pub fn with_config(path: impl Into<PathBuf>, config: AppConfig) -> Result<Self, ConfigError> {
        Self::layered(path.into(), config.clone(), config)
    }

    fn layered(path: PathBuf, file: AppConfig, effective: AppConfig) -> Result<Self, ConfigError> {
        let endpoint = effective.endpoint()?;
        let (endpoint_tx, _) = watch::channel(endpoint);
        Ok(Self {
            path,
            config: Mutex::new(Layers { file, effective }),
            endpoint_tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the settings in effect, overrides included
    pub fn config(&self) -> AppConfig {
        self.config.lock().effective.clone()
    }

    /// Current endpoint
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint_tx.borrow().clone()
    }

    /// Receive endpoint changes
    pub fn subscribe(&self) -> watch::Receiver<Endpoint> {
        self.endpoint_tx.subscribe()
    }

    /// Validate, persist and publish a new endpoint.
    ///
    /// An invalid URL leaves the file and subscribers untouched.
    pub fn set_endpoint(&self, url: &str) -> Result<Endpoint, ConfigError> {
        let endpoint = Endpoint::parse(url)?;

        let mut layers = self.config.lock();
        let mut file = layers.file.clone();
        file.endpoint = endpoint.as_str().to_string();
        file.to_file(&self.path)?;
        layers.file = file;
        layers.effective.endpoint = endpoint.as_str().to_string();
        drop(layers);

        info!(endpoint = %endpoint, "Endpoint updated");
        self.endpoint_tx.send_replace(endpoint.clone());
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn accepts_ws_and_wss() {
        assert!(Endpoint::parse("ws://127.0.0.1:8000/ws").is_ok());
        let secure = Endpoint::parse("  wss://stream.example.com/ingest ").unwrap();
        assert!(secure.is_secure());
        assert_eq!(secure.as_str(), "wss://stream.example.com/ingest");
    }

    #[test]
    fn rejects_invalid_endpoints() {
        for url in ["", "http://example.com/ws", "example.com/ws", "ws://", "ws:// bad host/"] {
            assert!(
                matches!(Endpoint::parse(url), Err(ConfigError::InvalidEndpoint { .. })),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn default_config_matches_constants() {
        let config = AppConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.sampler_config().min_frame_interval, DEFAULT_MIN_FRAME_INTERVAL);
        let transport = config.transport_config();
        assert_eq!(transport.max_attempts, 8);
        assert_eq!(transport.max_backoff, Duration::from_secs(60));
        assert_eq!(transport.probe_interval, Duration::from_secs(10));
        assert_eq!(config.backup.retention_days, 7);
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let config: AppConfig = toml::from_str(
            r#"
endpoint = "wss://example.com/ws"

[transport]
wire_format = "binary"
"#,
        )
        .unwrap();
        assert_eq!(config.endpoint, "wss://example.com/ws");
        assert_eq!(config.transport.wire_format, WireFormat::Binary);
        assert_eq!(config.transport.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[capture]"));
        assert_eq!(toml::from_str::<AppConfig>(&text).unwrap(), config);
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GEOSTREAM_ENDPOINT", "ws://10.0.0.2:9000/ws"),
            ("GEOSTREAM_FPS", "2"),
            ("GEOSTREAM_BACKUP", "0"),
            ("GEOSTREAM_STATIC_LOCATION", "12.34, 56.78, 5"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.endpoint, "ws://10.0.0.2:9000/ws");
        assert_eq!(config.capture.min_frame_interval_ms, 500);
        assert!(!config.backup.enabled);
        assert_eq!(config.static_location(), Some((12.34, 56.78, 5.0)));
    }

    #[test]
    fn static_location_parsing() {
        let mut config = AppConfig::default();
        config.capture.static_location = Some("1.5,2.5".into());
        assert_eq!(config.static_location(), Some((1.5, 2.5, 0.0)));
        config.capture.static_location = Some("nope".into());
        assert_eq!(config.static_location(), None);
    }

    #[test]
    fn store_persists_and_publishes_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.endpoint(), Endpoint::default());
        let mut rx = store.subscribe();

        store.set_endpoint("wss://example.com/live").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_str(), "wss://example.com/live");

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.endpoint().as_str(), "wss://example.com/live");
    }

    #[test]
    fn store_rejects_invalid_endpoint_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let store = ConfigStore::open(&path).unwrap();
        let rx = store.subscribe();

        let err = store.set_endpoint("http://example.com").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
        assert!(!rx.has_changed().unwrap());
        assert!(!path.exists());
        assert_eq!(store.endpoint(), Endpoint::default());
    }

    #[test]
    fn env_overrides_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut on_disk = AppConfig::default();
        on_disk.capture.jpeg_quality = 70;
        on_disk.to_file(&path).unwrap();

        let vars: HashMap<&str, &str> = [("GEOSTREAM_BACKUP", "0"), ("GEOSTREAM_FPS", "1")]
            .into_iter()
            .collect();
        let store =
            ConfigStore::open_with_overrides(&path, |k| vars.get(k).map(|v| v.to_string()))
                .unwrap();
        assert!(!store.config().backup.enabled);
        assert_eq!(store.config().capture.min_frame_interval_ms, 1000);

        store.set_endpoint("wss://example.com/live").unwrap();
        assert!(!store.config().backup.enabled);
        assert_eq!(store.config().endpoint, "wss://example.com/live");

        let reloaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.endpoint, "wss://example.com/live");
        assert!(reloaded.backup.enabled);
        assert_eq!(
            reloaded.capture.min_frame_interval_ms,
            DEFAULT_MIN_FRAME_INTERVAL.as_millis() as u64
        );
        assert_eq!(reloaded.capture.jpeg_quality, 70);
    }

    #[test]
    fn invalid_endpoint_in_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "endpoint = \"ftp://nope\"\n").unwrap();
        assert!(matches!(
            ConfigStore::open(&path),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }
}
