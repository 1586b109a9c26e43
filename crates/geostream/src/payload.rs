//! Wire message construction
//!
//! One JSON object per message:
//!
//! ```json
//! {"timestamp":"2024-05-01T12:00:00.250Z","lat":12.34,"lon":56.78,"accuracy":5.0,"image":"/9j/4AAQ..."}
//! ```
//!
//! The timestamp is the frame's capture time, never the encode time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EncodeError;
use crate::{FrameSample, LocationSample};

/// The serialized unit sent over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// ISO-8601 UTC capture time
    pub timestamp: String,
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f64,
    /// Base64 (standard alphabet, padded) JPEG bytes
    pub image: String,
}

impl WireMessage {
    /// Serialize to the JSON text sent on the wire
    pub fn to_json(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire JSON
    pub fn from_json(data: &[u8]) -> Result<Self, EncodeError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A wire message with its fields decoded back to native types
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub jpeg: Bytes,
}

/// Build a wire message from a frame and a location snapshot.
///
/// A stale location (access revoked, or no fix yet) is still encoded with
/// its last-known values.
pub fn encode(frame: &FrameSample, location: &LocationSample) -> Result<WireMessage, EncodeError> {
    if frame.jpeg.is_empty() {
        return Err(EncodeError::InvalidFrame("empty frame payload".to_string()));
    }
    for (name, value) in [
        ("lat", location.latitude),
        ("lon", location.longitude),
        ("accuracy", location.accuracy),
    ] {
        // serde_json would silently write `null`
        if !value.is_finite() {
            return Err(EncodeError::Malformed(format!("{} is not finite", name)));
        }
    }

    Ok(WireMessage {
        timestamp: frame.timestamp(),
        lat: location.latitude,
        lon: location.longitude,
        accuracy: location.accuracy,
        image: STANDARD.encode(&frame.jpeg),
    })
}

/// Parse and decode wire JSON
pub fn decode(data: &[u8]) -> Result<DecodedMessage, EncodeError> {
    let msg = WireMessage::from_json(data)?;
    decode_message(&msg)
}

/// Decode the string fields of a parsed message
pub fn decode_message(msg: &WireMessage) -> Result<DecodedMessage, EncodeError> {
    let captured_at = DateTime::parse_from_rfc3339(&msg.timestamp)
        .map_err(|e| EncodeError::Malformed(format!("timestamp {:?}: {}", msg.timestamp, e)))?
        .with_timezone(&Utc);
    let jpeg = STANDARD
        .decode(msg.image.as_bytes())
        .map_err(|e| EncodeError::Malformed(format!("image: {}", e)))?;

    Ok(DecodedMessage {
        captured_at,
        latitude: msg.lat,
        longitude: msg.lon,
        accuracy: msg.accuracy,
        jpeg: Bytes::from(jpeg),
    })
}

/// Encode directly to wire JSON
pub fn encode_json(frame: &FrameSample, location: &LocationSample) -> Result<String, EncodeError> {
    encode(frame, location)?.to_json()
}
