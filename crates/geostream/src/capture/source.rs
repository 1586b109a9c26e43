//! Frame sources and push-style adapters
//!
//! Platform camera and location APIs deliver data through callbacks on a
//! thread of their choosing. [`ChannelSource`] turns those callbacks into an
//! inbound mpsc stream: the platform side holds a cloneable [`Pusher`] whose
//! `push` never blocks, and the pipeline side consumes the receiver returned
//! by `start`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use super::location::{LocationEvent, LocationSource};
use crate::RawFrame;

/// A push-style provider of raw camera frames.
///
/// `start` must be called from within a tokio runtime. Frames from one source
/// arrive in order; the receiver closes when the source stops.
pub trait FrameSource: Send {
    fn start(&mut self) -> mpsc::Receiver<RawFrame>;
    fn stop(&mut self);
}

/// Callback-to-channel adapter, restartable across start/stop cycles
pub struct ChannelSource<T> {
    capacity: usize,
    slot: Arc<Mutex<Option<mpsc::Sender<T>>>>,
    dropped: Arc<AtomicU64>,
}

/// Channel adapter for camera callbacks
pub type ChannelFrameSource = ChannelSource<RawFrame>;

/// Channel adapter for location callbacks
pub type ChannelLocationSource = ChannelSource<LocationEvent>;

impl<T: Send + 'static> ChannelSource<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slot: Arc::new(Mutex::new(None)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle for the platform callback side
    pub fn pusher(&self) -> Pusher<T> {
        Pusher {
            slot: self.slot.clone(),
            dropped: self.dropped.clone(),
        }
    }

    /// Items discarded because the consumer was behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn open(&mut self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.slot.lock() = Some(tx);
        rx
    }

    fn close(&mut self) {
        self.slot.lock().take();
    }
}

impl FrameSource for ChannelSource<RawFrame> {
    fn start(&mut self) -> mpsc::Receiver<RawFrame> {
        self.open()
    }

    fn stop(&mut self) {
        self.close();
    }
}

impl LocationSource for ChannelSource<LocationEvent> {
    fn start(&mut self) -> mpsc::Receiver<LocationEvent> {
        self.open()
    }

    fn stop(&mut self) {
        self.close();
    }
}

/// Non-blocking sender usable from any thread
pub struct Pusher<T> {
    slot: Arc<Mutex<Option<mpsc::Sender<T>>>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Pusher<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> Pusher<T> {
    /// Hand an item to the pipeline.
    ///
    /// Returns false if the source is stopped or the consumer is behind; in
    /// the latter case the item is discarded and counted.
    pub fn push(&self, item: T) -> bool {
        let slot = self.slot.lock();
        let Some(tx) = slot.as_ref() else {
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

// ========== Test source ==========

/// Configuration for the synthetic frame source
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    pub width: u32,
    pub height: u32,
    /// Frames generated per second (camera rate, before throttling)
    pub fps: u32,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Generates a moving RGB gradient at a fixed camera rate.
///
/// Behaves like a real camera: if the consumer is behind, frames are
/// discarded rather than queued.
pub struct TestFrameSource {
    config: TestSourceConfig,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TestFrameSource {
    pub fn new(config: TestSourceConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
        }
    }
}

impl FrameSource for TestFrameSource {
    fn start(&mut self) -> mpsc::Receiver<RawFrame> {
        let (tx, rx) = mpsc::channel(2);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        let config = self.config.clone();

        tokio::spawn(async move {
            let period = Duration::from_secs(1) / config.fps.max(1);
            let mut interval = tokio::time::interval(period);
            let mut index: u64 = 0;

            info!(
                "Test frame source started: {}x{} @ {}fps",
                config.width, config.height, config.fps
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let frame = gradient_frame(config.width, config.height, index);
                        index += 1;
                        match tx.try_send(frame) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Closed(_)) => {
                                debug!("Test frame receiver dropped");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Test frame source shutdown requested");
                        break;
                    }
                }
            }
        });

        rx
    }

    fn stop(&mut self) {
        self.shutdown_tx.take();
    }
}

impl Drop for TestFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Diagonal RGB gradient shifted by `index`
fn gradient_frame(width: u32, height: u32, index: u64) -> RawFrame {
    let shift = (index % 256) as u32;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.push(((x + shift) % 256) as u8);
            pixels.push(((y + shift) % 256) as u8);
            pixels.push(((x + y) / 2 % 256) as u8);
        }
    }
    RawFrame::rgb(width, height, Bytes::from(pixels))
}
