//! Geostream - live camera frame + GPS streaming pipeline
//!
//! Captures frames and location fixes on a device and streams them as JSON
//! messages to a remote server over a persistent WebSocket, while keeping a
//! time-bounded local backup of every accepted frame.
//!
//! ```text
//!  frame source ──► Sampler (throttle, JPEG) ──┬──► payload::encode ──► Transport ──► server
//!  location source ──► LocationTracker ────────┤
//!                                              └──► BackupCache (7-day retention)
//! ```
//!
//! - **Core types**: [`FrameSample`], [`RawFrame`], [`LocationSample`], [`LocationFix`]
//! - **`capture`**: throttle, JPEG compression, frame/location sources, fps estimate
//! - **`payload`**: wire message construction and decoding
//! - **`transport`**: connection state machine, backoff, liveness probing, send path
//! - **`backup`**: on-disk retention cache
//! - **`session`**: the orchestrator wiring it all together
//! - **`config`**: persisted settings and endpoint validation

mod error;
mod frame;
mod protocol;

pub mod backup;
pub mod capture;
pub mod config;
pub mod payload;
pub mod session;
pub mod transport;

pub use error::{ConfigError, EncodeError, Error, Result, StorageError, TransportError};
pub use frame::{FrameSample, LocationFix, LocationSample, RawFrame};
pub use protocol::*;
