//! Filesystem backup cache

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::{FrameSample, LocationSample, BACKUP_FRAME_FILE, BACKUP_METADATA_FILE};

const TEMP_PREFIX: &str = ".tmp-";

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Metadata record stored next to each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: String,
    pub lat: f64,
    pub lon: f64,
}

/// A retained entry
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub key: String,
    pub path: PathBuf,
    /// Directory birth time (modification time where unsupported)
    pub created: SystemTime,
}

/// Result of a retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub kept: usize,
    pub failed: usize,
}

/// Replace every character outside `[A-Za-z0-9._-]` with `-`
pub fn sanitize_key(timestamp: &str) -> String {
    let key: String = timestamp
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    // Dot-prefixed names are reserved for temp dirs
    match key.strip_prefix('.') {
        Some(rest) => format!("-{}", rest),
        None => key,
    }
}

/// Time-bounded on-disk frame cache. Exclusively owns its root directory.
#[derive(Debug)]
pub struct BackupCache {
    root: PathBuf,
    retention: Duration,
}

impl BackupCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>, retention: Duration) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Write {
            key: root.display().to_string(),
            source,
        })?;
        debug!(root = %root.display(), "Backup cache opened");
        Ok(Self { root, retention })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Write a frame and its metadata under the sanitized `timestamp`.
    ///
    /// A colliding key is replaced (last write wins).
    pub fn save(
        &self,
        frame: &FrameSample,
        location: &LocationSample,
        timestamp: &str,
    ) -> Result<String, StorageError> {
        let key = sanitize_key(timestamp);
        let write_err = |source: io::Error| StorageError::Write {
            key: key.clone(),
            source,
        };

        let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .root
            .join(format!("{}{}-{}-{}", TEMP_PREFIX, key, std::process::id(), nonce));
        let metadata = BackupMetadata {
            timestamp: timestamp.to_string(),
            lat: location.latitude,
            lon: location.longitude,
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata).map_err(|source| {
            StorageError::Metadata {
                key: key.clone(),
                source,
            }
        })?;

        let staged = (|| -> io::Result<()> {
            fs::create_dir_all(&tmp)?;
            fs::write(tmp.join(BACKUP_FRAME_FILE), &frame.jpeg)?;
            fs::write(tmp.join(BACKUP_METADATA_FILE), &metadata_json)?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&tmp);
            return Err(write_err(e));
        }

        let dest = self.root.join(&key);
        if let Err(e) = self.install(&tmp, &dest) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(write_err(e));
        }

        debug!(key = %key, bytes = frame.jpeg.len(), "Backup entry saved");
        Ok(key)
    }

    /// Rename the staged directory into place, replacing an existing entry
    fn install(&self, tmp: &Path, dest: &Path) -> io::Result<()> {
        if dest.exists() {
            warn!(path = %dest.display(), "Backup key collision, replacing entry");
            remove_entry_dir(dest)?;
        }
        match fs::rename(tmp, dest) {
            Ok(()) => Ok(()),
            // A concurrent save for the same key won the race
            Err(_) if dest.exists() => {
                remove_entry_dir(dest)?;
                fs::rename(tmp, dest)
            }
            Err(e) => Err(e),
        }
    }

    /// Keys of retained entries, newest first.
    ///
    /// Always read from disk.
    pub fn list_entries(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries()?.into_iter().map(|e| e.key).collect())
    }

    /// Retained entries with paths and creation times, newest first
    pub fn entries(&self) -> Result<Vec<BackupEntry>, StorageError> {
        let read_err = |source| StorageError::Read {
            path: self.root.display().to_string(),
            source,
        };

        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.root).map_err(read_err)? {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable backup entry");
                    continue;
                }
            };
            let Some(key) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            let path = dir_entry.path();
            let Ok(meta) = dir_entry.metadata() else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            entries.push(BackupEntry {
                key,
                path,
                created: created_time(&meta),
            });
        }

        // Sanitized ISO-8601 keys sort chronologically
        entries.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(entries)
    }

    /// Directory of an entry (the key is sanitized first)
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    pub fn read_metadata(&self, key: &str) -> Result<BackupMetadata, StorageError> {
        let path = self.entry_path(key).join(BACKUP_METADATA_FILE);
        let data = fs::read(&path).map_err(|source| StorageError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| StorageError::Metadata {
            key: key.to_string(),
            source,
        })
    }

    pub fn read_frame(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.entry_path(key).join(BACKUP_FRAME_FILE);
        fs::read(&path).map_err(|source| StorageError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    /// Total bytes of all retained entries
    pub fn usage_bytes(&self) -> u64 {
        self.entries()
            .unwrap_or_default()
            .iter()
            .map(|e| dir_size(&e.path))
            .sum()
    }

    /// Remove entries older than the retention window, as of now
    pub fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(SystemTime::now())
    }

    /// Remove entries created more than `retention` before `now`.
    ///
    /// Failures are logged and skipped; the sweep always covers every entry.
    /// Stale temp directories from interrupted saves are removed too.
    pub fn sweep_expired_at(&self, now: SystemTime) -> SweepReport {
        self.sweep_with(now, remove_entry_dir)
    }

    fn sweep_with(
        &self,
        now: SystemTime,
        remove: impl Fn(&Path) -> io::Result<()>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Backup sweep could not list root");
                return report;
            }
        };

        for dir_entry in dir.flatten() {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let is_temp = name.starts_with(TEMP_PREFIX);
            if name.starts_with('.') && !is_temp {
                continue;
            }
            let meta = match dir_entry.metadata() {
                Ok(meta) if meta.is_dir() => meta,
                Ok(_) => continue,
                Err(e) => {
                    warn!(entry = %name, error = %e, "Skipping backup entry without metadata");
                    report.failed += 1;
                    continue;
                }
            };

            let age = now
                .duration_since(created_time(&meta))
                .unwrap_or(Duration::ZERO);
            if age <= self.retention {
                if !is_temp {
                    report.kept += 1;
                }
                continue;
            }

            match remove(&dir_entry.path()) {
                Ok(()) => {
                    debug!(entry = %name, age_hours = age.as_secs() / 3600, "Expired backup entry removed");
                    if !is_temp {
                        report.removed.push(name);
                    }
                }
                Err(source) => {
                    let e = StorageError::Delete { key: name, source };
                    warn!(error = %e, "Failed to remove expired backup entry, skipping");
                    report.failed += 1;
                }
            }
        }

        if !report.removed.is_empty() || report.failed > 0 {
            info!(
                removed = report.removed.len(),
                kept = report.kept,
                failed = report.failed,
                "Backup sweep finished"
            );
        }
        report
    }
}

fn remove_entry_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Birth time where the filesystem records it, else modification time
fn created_time(meta: &fs::Metadata) -> SystemTime {
    meta.created()
        .or_else(|_| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn dir_size(path: &Path) -> u64 {
    fs::read_dir(path)
        .map(|dir| {
            dir.flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
