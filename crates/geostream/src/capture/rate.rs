//! Sliding-window frame rate measurement
//!
//! Counts accepted frames over a configurable time window to give the
//! frames-per-second figure shown next to the connection indicator.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Measures accepted frames per second over a sliding time window.
pub struct FrameRateTracker {
    samples: VecDeque<Instant>,
    window: Duration,
    total: u64,
}

impl FrameRateTracker {
    /// Create a new tracker with the given measurement window.
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            total: 0,
        }
    }

    /// Record a frame accepted at `now`.
    pub fn record(&mut self, now: Instant) {
        self.total += 1;
        self.samples.push_back(now);
        self.prune(now);
    }

    /// Frames per second over the window ending at `now`.
    ///
    /// Returns 0.0 with fewer than 2 samples or a span under 100ms
    /// (avoids noisy readings right after start).
    pub fn fps_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.samples.len() < 2 {
            return 0.0;
        }

        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span = newest.duration_since(*oldest);
        if span.as_millis() < 100 {
            return 0.0;
        }

        (self.samples.len() - 1) as f64 / span.as_secs_f64()
    }

    /// Frames recorded since creation or the last reset
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.total = 0;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
