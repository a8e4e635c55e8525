//! Throughput accumulator shared by the upload and download tests

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Rate in kbit/s, `None` when no time elapsed
pub fn rate_kbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some((bytes as f64 * 8.0 / 1000.0) / secs)
}

/// Start/end instants plus a byte counter that spawned I/O tasks add to
#[derive(Debug, Default)]
pub struct Throughput {
    started: Option<Instant>,
    ended: Option<Instant>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    bytes: Arc<AtomicU64>,
}

impl Throughput {
    /// Handle for the task doing the I/O
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes)
    }

    pub fn start(&mut self, at: Instant) {
        self.started = Some(at);
        self.started_at = Some(Utc::now());
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.ended.is_some()
    }

    /// Close the measurement window and compute the rate.
    ///
    /// Only the first call counts. Returns `None` if the window never
    /// opened or no time elapsed.
    pub fn finish(&mut self, at: Instant) -> Option<f64> {
        if self.ended.is_none() {
            self.ended = Some(at);
            self.ended_at = Some(Utc::now());
        }
        self.rate_kbps()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started, self.ended) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    pub fn rate_kbps(&self) -> Option<f64> {
        rate_kbps(self.bytes(), self.elapsed()?)
    }
}
