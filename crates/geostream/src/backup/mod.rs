//! Local backup of accepted frames
//!
//! Layout, one directory per capture:
//!
//! ```text
//! <root>/
//!   2024-05-01T12-00-00.250Z/
//!     frame.jpg
//!     metadata.json      {"timestamp": .., "lat": .., "lon": ..}
//! ```
//!
//! Entries are written into a dot-prefixed temp directory and renamed into
//! place, so a sweep never sees a half-written entry. Entries older than the
//! retention window are removed by [`BackupCache::sweep_expired`].

mod cache;
mod worker;

pub use cache::{sanitize_key, BackupCache, BackupEntry, BackupMetadata, SweepReport};
pub use worker::{spawn_sweeper, BackupWorker};

use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL};

/// Backup configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Root directory for entries
    pub root: PathBuf,
    /// Entries older than this are swept
    pub retention: Duration,
    /// Periodic sweep interval
    pub sweep_interval: Duration,
    /// Pending saves before new frames are dropped from the backup path
    pub queue_capacity: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("StreamBackup"),
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            queue_capacity: 16,
        }
    }
}
