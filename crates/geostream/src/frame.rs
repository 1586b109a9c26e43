//! Frame and location types flowing through the pipeline

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A frame as delivered by the platform camera callback, before throttling.
#[derive(Debug, Clone)]
pub enum RawFrame {
    /// Packed 8-bit RGB pixels, row-major, `width * height * 3` bytes
    Rgb {
        width: u32,
        height: u32,
        pixels: Bytes,
    },
    /// Already JPEG-compressed by the platform
    Jpeg(Bytes),
}

impl RawFrame {
    /// Create an RGB frame
    pub fn rgb(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self::Rgb {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Size of the raw payload in bytes
    pub fn len(&self) -> usize {
        match self {
            RawFrame::Rgb { pixels, .. } => pixels.len(),
            RawFrame::Jpeg(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A throttled, compressed frame.
///
/// Immutable once produced. The JPEG payload is a `Bytes`, so the transmit
/// path and the backup path each hold their own handle and may drop it
/// independently.
#[derive(Debug, Clone)]
pub struct FrameSample {
    /// Per-session capture counter (accepted frames only)
    pub sequence: u64,
    /// Wall-clock capture time, used for the wire timestamp and backup key
    pub captured_at: DateTime<Utc>,
    /// Monotonic capture time, used for throttling and fps
    pub monotonic: Instant,
    /// Compressed JPEG bytes
    pub jpeg: Bytes,
}

impl FrameSample {
    pub fn new(sequence: u64, captured_at: DateTime<Utc>, monotonic: Instant, jpeg: Bytes) -> Self {
        Self {
            sequence,
            captured_at,
            monotonic,
            jpeg,
        }
    }

    /// ISO-8601 UTC capture timestamp with millisecond precision
    pub fn timestamp(&self) -> String {
        iso8601(&self.captured_at)
    }
}

/// Format a UTC instant the way the wire protocol expects (`2024-05-01T12:00:00.250Z`)
pub(crate) fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A raw position fix from the platform location provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Latitude in degrees (positive = north)
    pub latitude: f64,
    /// Longitude in degrees (positive = east)
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    /// When the fix was taken
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp: Utc::now(),
        }
    }

    /// Whether the fix is usable.
    ///
    /// Platforms report a negative accuracy for an invalid fix.
    pub fn is_valid(&self) -> bool {
        self.accuracy.is_finite()
            && self.accuracy >= 0.0
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// The current location, updated in place as fixes arrive.
///
/// When `authorized` is false the coordinates are the last known values and
/// must not be treated as fresh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Always >= 0
    pub accuracy: f64,
    pub authorized: bool,
    /// Time of the last accepted fix (None until the first one)
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for LocationSample {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            accuracy: 0.0,
            authorized: true,
            updated_at: None,
        }
    }
}

impl LocationSample {
    /// True when the coordinates come from an authorized, received fix
    pub fn is_fresh(&self) -> bool {
        self.authorized && self.updated_at.is_some()
    }
}
