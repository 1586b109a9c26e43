//! Background save and sweep tasks
//!
//! Saves run on the blocking pool, fed by a bounded queue. A full queue drops
//! the backup copy of a frame; capture and transmission never wait on disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::BackupCache;
use crate::{FrameSample, LocationSample};

struct Job {
    frame: FrameSample,
    location: LocationSample,
}

/// Handle for queueing backup saves
pub struct BackupWorker {
    tx: mpsc::Sender<Job>,
    saved: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl BackupWorker {
    /// Start the save task. It exits once the handle is dropped and the queue
    /// has drained.
    pub fn spawn(cache: Arc<BackupCache>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let saved = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let task_saved = saved.clone();
        let task_failed = failed.clone();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let cache = cache.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let timestamp = job.frame.timestamp();
                    cache.save(&job.frame, &job.location, &timestamp)
                })
                .await;

                match result {
                    Ok(Ok(key)) => {
                        task_saved.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Frame backed up");
                    }
                    Ok(Err(e)) => {
                        task_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Backup save failed");
                    }
                    Err(e) => {
                        task_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Backup save task panicked");
                    }
                }
            }
            debug!("Backup worker stopped");
        });

        (
            Self {
                tx,
                saved,
                failed,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// Queue a save without waiting. Returns false if the frame was dropped.
    pub fn submit(&self, frame: FrameSample, location: LocationSample) -> bool {
        match self.tx.try_send(Job { frame, location }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Backup queue full, frame not backed up");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    /// Shared save counter, readable after the worker has exited
    pub(crate) fn saved_counter(&self) -> Arc<AtomicU64> {
        self.saved.clone()
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sweep expired entries now and then every `interval` until cancelled
pub fn spawn_sweeper(
    cache: Arc<BackupCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Backup sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cache = cache.clone();
                    match tokio::task::spawn_blocking(move || cache.sweep_expired()).await {
                        Ok(report) if !report.removed.is_empty() => {
                            info!("Periodic sweep: removed {} expired entries", report.removed.len());
                        }
                        Ok(_) => debug!("Periodic sweep: nothing to remove"),
                        Err(e) => warn!(error = %e, "Periodic sweep task failed"),
                    }
                }
            }
        }
    })
}
