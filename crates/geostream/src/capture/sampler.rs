//! Frame sampler: hard rate limiting and fixed-quality compression
//!
//! The throttle is a rate limiter, not a queue. A frame arriving sooner than
//! `min_frame_interval` after the last accepted one is discarded before any
//! compression work is done, so capture can never fall behind.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::location::{LocationEvent, LocationTracker};
use crate::error::EncodeError;
use crate::{FrameSample, LocationSample, RawFrame, DEFAULT_JPEG_QUALITY, DEFAULT_MIN_FRAME_INTERVAL};

/// Configuration for the sampler
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Minimum spacing between accepted frames
    pub min_frame_interval: Duration,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_frame_interval: DEFAULT_MIN_FRAME_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Minimum-interval gate
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: None,
        }
    }

    /// Admit a frame arriving at `now`, or reject it if it is too soon
    /// after the previously admitted one.
    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }

    /// Forget the last accepted frame (next frame is always admitted)
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Turns a raw platform frame into compressed bytes
pub trait FrameCompressor: Send + Sync {
    fn compress(&self, frame: RawFrame) -> Result<Bytes, EncodeError>;
}

/// Fixed-quality JPEG compressor.
///
/// RGB frames are encoded; frames the platform already compressed are
/// passed through after a JPEG signature check.
#[derive(Debug, Clone)]
pub struct JpegCompressor {
    quality: u8,
}

impl JpegCompressor {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameCompressor for JpegCompressor {
    fn compress(&self, frame: RawFrame) -> Result<Bytes, EncodeError> {
        match frame {
            RawFrame::Jpeg(data) => {
                if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
                    return Err(EncodeError::InvalidFrame(
                        "payload is not a JPEG image".to_string(),
                    ));
                }
                Ok(data)
            }
            RawFrame::Rgb {
                width,
                height,
                pixels,
            } => {
                if width == 0 || height == 0 {
                    return Err(EncodeError::InvalidFrame(format!(
                        "zero-sized frame {}x{}",
                        width, height
                    )));
                }
                let expected = (width as usize)
                    .checked_mul(height as usize)
                    .and_then(|n| n.checked_mul(3))
                    .ok_or_else(|| {
                        EncodeError::InvalidFrame(format!("frame too large: {}x{}", width, height))
                    })?;
                if pixels.len() != expected {
                    return Err(EncodeError::InvalidFrame(format!(
                        "{}x{} RGB frame needs {} bytes, got {}",
                        width,
                        height,
                        expected,
                        pixels.len()
                    )));
                }

                let mut out = Vec::with_capacity(expected / 8);
                JpegEncoder::new_with_quality(&mut out, self.quality)
                    .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
                    .map_err(|e| EncodeError::Compression(e.to_string()))?;
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Sampler counters (snapshot)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub frames_offered: u64,
    pub frames_accepted: u64,
    pub frames_throttled: u64,
    pub frames_failed: u64,
}

/// Produces a bounded-rate stream of [`FrameSample`]s and keeps the current
/// [`LocationSample`] up to date.
///
/// Safe to call from the capture thread and the location thread at the same
/// time; callbacks from a single source are expected to be serialized.
pub struct Sampler {
    throttle: Mutex<Throttle>,
    compressor: Box<dyn FrameCompressor>,
    location: Arc<LocationTracker>,
    sequence: AtomicU64,
    frames_offered: AtomicU64,
    frames_throttled: AtomicU64,
    frames_failed: AtomicU64,
}

impl Sampler {
    /// Create a sampler with the default JPEG compressor
    pub fn new(config: SamplerConfig, location: Arc<LocationTracker>) -> Self {
        let compressor = JpegCompressor::new(config.jpeg_quality);
        Self::with_compressor(config, location, Box::new(compressor))
    }

    pub fn with_compressor(
        config: SamplerConfig,
        location: Arc<LocationTracker>,
        compressor: Box<dyn FrameCompressor>,
    ) -> Self {
        Self {
            throttle: Mutex::new(Throttle::new(config.min_frame_interval)),
            compressor,
            location,
            sequence: AtomicU64::new(0),
            frames_offered: AtomicU64::new(0),
            frames_throttled: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
        }
    }

    /// Offer a raw frame from the camera callback.
    ///
    /// Returns `None` when the frame was throttled or could not be compressed;
    /// compression failures are logged and only drop this frame.
    pub fn capture_frame(&self, raw: RawFrame) -> Option<FrameSample> {
        match self.capture_frame_at(raw, Instant::now(), Utc::now()) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Dropping frame that failed to compress");
                None
            }
        }
    }

    /// [`capture_frame`](Self::capture_frame) with explicit clocks
    pub fn capture_frame_at(
        &self,
        raw: RawFrame,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<Option<FrameSample>, EncodeError> {
        if !self.admit(now) {
            return Ok(None);
        }
        self.compress_admitted(raw, now, wall).map(Some)
    }

    /// Throttle step of [`capture_frame_at`](Self::capture_frame_at).
    ///
    /// Cheap enough for the capture thread; a `true` must be followed by
    /// [`compress_admitted`](Self::compress_admitted) for the same frame.
    pub fn admit(&self, now: Instant) -> bool {
        self.frames_offered.fetch_add(1, Ordering::Relaxed);
        if !self.throttle.lock().admit(now) {
            self.frames_throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Compression step for a frame that passed [`admit`](Self::admit).
    /// CPU-bound; callers on the async runtime should run it on the blocking pool.
    pub fn compress_admitted(
        &self,
        raw: RawFrame,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<FrameSample, EncodeError> {
        let jpeg = self.compressor.compress(raw).inspect_err(|_| {
            self.frames_failed.fetch_add(1, Ordering::Relaxed);
        })?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(sequence, len = jpeg.len(), "Frame accepted");
        Ok(FrameSample::new(sequence, wall, now, jpeg))
    }

    /// Apply a location event (fix or authorization change)
    pub fn update_location(&self, event: LocationEvent) -> bool {
        self.location.apply(event)
    }

    /// Read-only snapshot of the current location
    pub fn location(&self) -> LocationSample {
        self.location.snapshot()
    }

    /// Shared location tracker
    pub fn location_tracker(&self) -> &Arc<LocationTracker> {
        &self.location
    }

    /// Start a new capture session: the next frame is admitted immediately
    /// and sequence numbers restart at zero.
    pub fn reset(&self) {
        self.throttle.lock().reset();
        self.sequence.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SamplerStats {
        let frames_offered = self.frames_offered.load(Ordering::Relaxed);
        let frames_throttled = self.frames_throttled.load(Ordering::Relaxed);
        let frames_failed = self.frames_failed.load(Ordering::Relaxed);
        SamplerStats {
            frames_offered,
            frames_accepted: frames_offered.saturating_sub(frames_throttled + frames_failed),
            frames_throttled,
            frames_failed,
        }
    }
}
