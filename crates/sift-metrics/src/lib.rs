//! # Sift Metrics
//!
//! Structured logging setup and filtering metrics.
//!
//! Metrics go through the `metrics` facade, so they are no-ops until a
//! recorder (e.g. the Prometheus exporter) is installed.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

pub mod prometheus;
pub mod tracing_setup;

/// Filtering engine metrics.
///
/// Owned by the engine instance; holds no state of its own beyond labels.
#[derive(Debug, Clone, Default)]
pub struct FilterMetrics {
    _private: (),
}

impl FilterMetrics {
    /// Creates a new metrics handle.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Verdict metrics
    // =========================================================================

    /// Records a finished host check.
    pub fn record_check(&self, reason: &'static str, duration: Duration) {
        counter!("sift_checks_total", "reason" => reason).increment(1);
        histogram!("sift_check_duration_seconds").record(duration.as_secs_f64());
    }

    /// Updates the loaded rule count gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rules_loaded(&self, count: usize) {
        gauge!("sift_rules_loaded").set(count as f64);
    }

    /// Records a completed rule set rebuild.
    pub fn record_reload(&self, duration: Duration) {
        counter!("sift_reloads_total").increment(1);
        histogram!("sift_reload_duration_seconds").record(duration.as_secs_f64());
    }

    // =========================================================================
    // Reputation metrics
    // =========================================================================

    /// Records a reputation upstream request.
    pub fn record_reputation_request(&self, service: &'static str) {
        counter!("sift_reputation_requests_total", "service" => service).increment(1);
    }

    /// Records a reputation lookup answered from cache.
    pub fn record_reputation_cache_hit(&self, service: &'static str) {
        counter!("sift_reputation_cache_hits_total", "service" => service).increment(1);
    }

    /// Records a failed reputation lookup.
    pub fn record_reputation_failure(&self, service: &'static str) {
        counter!("sift_reputation_failures_total", "service" => service).increment(1);
    }

    /// Updates the pending reputation requests gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_reputation_pending(&self, service: &'static str, pending: i64) {
        gauge!("sift_reputation_pending", "service" => service).set(pending as f64);
    }
}

/// Check timing helper.
pub struct CheckTimer {
    start: Instant,
}

impl CheckTimer {
    /// Starts a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finishes timing and records the verdict.
    pub fn finish(self, metrics: &FilterMetrics, reason: &'static str) {
        metrics.record_check(reason, self.elapsed());
    }
}
