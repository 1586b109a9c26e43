//! Protocol constants and pipeline defaults

use std::time::Duration;

/// Minimum spacing between accepted frames (~5 Hz cap)
pub const DEFAULT_MIN_FRAME_INTERVAL: Duration = Duration::from_millis(200);

/// JPEG quality used for every transmitted frame
pub const DEFAULT_JPEG_QUALITY: u8 = 50;

/// Keepalive ping period while connected
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a ping may go unanswered before the link is declared dead
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts before giving up with `MaxRetriesExceeded`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Upper bound on a single backoff delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Transport log capacity (oldest entries evicted first)
pub const DEFAULT_LOG_CAPACITY: usize = 300;

/// Socket handshake budget
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A write that takes longer than this means the connection is dead
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Backup entries older than this are swept
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Periodic backup sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay between bringing up location and starting camera capture
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(400);

/// Endpoint used when nothing has been configured yet
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws";

/// Frame file name inside a backup entry
pub const BACKUP_FRAME_FILE: &str = "frame.jpg";

/// Metadata file name inside a backup entry
pub const BACKUP_METADATA_FILE: &str = "metadata.json";
