//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector for the density pipeline
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps interval counters to get a
/// consistent snapshot.
pub struct Metrics {
    /// Frames read from the frames channel (monotonic)
    frames_received: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Detector invocation failures (monotonic)
    detect_failures: AtomicU64,
    /// Live samples published (monotonic)
    live_published: AtomicU64,
    /// Forecast samples published (monotonic)
    forecast_published: AtomicU64,
    /// Live samples discarded by the latest-wins window (monotonic)
    forecast_discarded: AtomicU64,
    /// Forecaster invocation failures (monotonic)
    forecast_failures: AtomicU64,
    /// Payloads on the live channel that were not live-tagged (monotonic)
    forecast_filtered: AtomicU64,
    /// Client sessions opened (monotonic)
    sessions_opened: AtomicU64,
    /// Client sessions closed (monotonic)
    sessions_closed: AtomicU64,
    /// Currently connected sessions (gauge)
    active_sessions: AtomicU64,
    /// Messages relayed to clients from the live channel (monotonic)
    relayed_live: AtomicU64,
    /// Messages relayed to clients from the predicted channel (monotonic)
    relayed_forecast: AtomicU64,
    /// Time of last report, for per-second rates. Only report() touches it.
    last_report: Mutex<Instant>,
}

/// Snapshot of metrics at report time
#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub detect_failures: u64,
    pub live_published: u64,
    pub forecast_published: u64,
    pub forecast_discarded: u64,
    pub forecast_failures: u64,
    pub forecast_filtered: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub active_sessions: u64,
    pub relayed_live: u64,
    pub relayed_forecast: u64,
}

impl MetricsSummary {
    /// Log the summary as a structured event
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = %format!("{:.2}", self.frames_per_sec),
            detect_failures = %self.detect_failures,
            live_published = %self.live_published,
            forecast_published = %self.forecast_published,
            forecast_discarded = %self.forecast_discarded,
            active_sessions = %self.active_sessions,
            relayed_live = %self.relayed_live,
            relayed_forecast = %self.relayed_forecast,
            "metrics_report"
        );
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            detect_failures: AtomicU64::new(0),
            live_published: AtomicU64::new(0),
            forecast_published: AtomicU64::new(0),
            forecast_discarded: AtomicU64::new(0),
            forecast_failures: AtomicU64::new(0),
            forecast_filtered: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            relayed_live: AtomicU64::new(0),
            relayed_forecast: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detect_failure(&self) {
        self.detect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_live_published(&self) {
        self.live_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forecast_published(&self) {
        self.forecast_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forecast_discarded(&self, count: u64) {
        self.forecast_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_forecast_failure(&self) {
        self.forecast_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forecast_filtered(&self) {
        self.forecast_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        // Saturating decrement; a stray double-close must not wrap the gauge
        let _ = self.active_sessions.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            v.checked_sub(1)
        });
    }

    pub fn record_relayed_live(&self) {
        self.relayed_live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed_forecast(&self) {
        self.relayed_forecast.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot, resetting interval counters
    pub fn report(&self) -> MetricsSummary {
        let interval_secs = {
            let mut last = match self.last_report.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };
        let frames_interval = self.frames_since_report.swap(0, Ordering::Relaxed);
        let frames_per_sec =
            if interval_secs > 0.0 { frames_interval as f64 / interval_secs } else { 0.0 };

        MetricsSummary {
            frames_total: self.frames_received.load(Ordering::Relaxed),
            frames_per_sec,
            detect_failures: self.detect_failures.load(Ordering::Relaxed),
            live_published: self.live_published.load(Ordering::Relaxed),
            forecast_published: self.forecast_published.load(Ordering::Relaxed),
            forecast_discarded: self.forecast_discarded.load(Ordering::Relaxed),
            forecast_failures: self.forecast_failures.load(Ordering::Relaxed),
            forecast_filtered: self.forecast_filtered.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            relayed_live: self.relayed_live.load(Ordering::Relaxed),
            relayed_forecast: self.relayed_forecast.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counters() {
        let metrics = Metrics::new();
        metrics.record_frame_received();
        metrics.record_frame_received();
        metrics.record_detect_failure();
        metrics.record_live_published();

        let summary = metrics.report();
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.detect_failures, 1);
        assert_eq!(summary.live_published, 1);
    }

    #[test]
    fn test_interval_counter_resets() {
        let metrics = Metrics::new();
        metrics.record_frame_received();
        let first = metrics.report();
        let second = metrics.report();

        // Monotonic total survives the report; the per-interval count resets
        assert_eq!(first.frames_total, 1);
        assert_eq!(second.frames_total, 1);
        assert_eq!(second.frames_per_sec, 0.0);
    }

    #[test]
    fn test_session_gauge() {
        let metrics = Metrics::new();
        metrics.record_session_opened();
        metrics.record_session_opened();
        metrics.record_session_closed();

        let summary = metrics.report();
        assert_eq!(summary.sessions_opened, 2);
        assert_eq!(summary.sessions_closed, 1);
        assert_eq!(summary.active_sessions, 1);
    }

    #[test]
    fn test_session_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.record_session_closed();
        assert_eq!(metrics.report().active_sessions, 0);
    }

    #[test]
    fn test_forecast_discard_batch() {
        let metrics = Metrics::new();
        metrics.record_forecast_discarded(3);
        metrics.record_forecast_published();

        let summary = metrics.report();
        assert_eq!(summary.forecast_discarded, 3);
        assert_eq!(summary.forecast_published, 1);
    }
}
