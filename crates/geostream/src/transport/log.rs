//! Bounded, most-recent-first transport log

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// What an entry is about, so a UI can react to specific events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Connection lifecycle transition
    State,
    /// A transport error that drives reconnect
    Failure,
    /// Inbound data from the server
    Inbound,
    /// Outbound messages written to the socket (aggregated)
    Sent,
    /// Outbound messages discarded
    Dropped,
    /// Reconnect budget exhausted; user action needed
    MaxRetries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub kind: LogKind,
    pub message: String,
    pub error: Option<TransportError>,
}

/// Ring of log entries, newest first; the oldest entry is evicted when full
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry and mirror it to tracing
    pub fn record(
        &mut self,
        level: LogLevel,
        kind: LogKind,
        message: impl Into<String>,
        err: Option<TransportError>,
    ) {
        let message = message.into();
        match (level, &err) {
            (LogLevel::Info, _) => info!(target: "geostream::transport", "{}", message),
            (LogLevel::Warn, Some(e)) => warn!(target: "geostream::transport", error = %e, "{}", message),
            (LogLevel::Warn, None) => warn!(target: "geostream::transport", "{}", message),
            (LogLevel::Error, Some(e)) => error!(target: "geostream::transport", error = %e, "{}", message),
            (LogLevel::Error, None) => error!(target: "geostream::transport", "{}", message),
        }

        self.entries.push_front(LogEntry {
            at: Utc::now(),
            level,
            kind,
            message,
            error: err,
        });
        self.entries.truncate(self.capacity);
    }

    pub fn info(&mut self, kind: LogKind, message: impl Into<String>) {
        self.record(LogLevel::Info, kind, message, None);
    }

    /// Entries, newest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
