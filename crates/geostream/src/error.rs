//! Error taxonomy
//!
//! Transport errors never escape the transport actor as failures; they are
//! recorded in the log and `last_error` and drive the reconnect state machine.
//! They are `Clone` so a single error can live in both places.

use thiserror::Error;

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Connection-level failures, all recovered by the transport state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Liveness probe failed: {0}")]
    Probe(String),

    #[error("Gave up after {attempts} reconnect attempts")]
    MaxRetriesExceeded { attempts: u32 },
}

/// Payload construction failures; only the affected frame is dropped
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("JPEG compression failed: {0}")]
    Compression(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed wire message: {0}")]
    Malformed(String),
}

/// Backup cache failures; logged and skipped per entry
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to write entry {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete entry {key}: {source}")]
    Delete {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata in {key}: {source}")]
    Metadata {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Backup worker unavailable: {0}")]
    Worker(String),
}

/// Settings failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No home directory to place settings in")]
    NoProjectDirs,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
