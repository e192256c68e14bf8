//! Prometheus metrics exporter.

use std::net::SocketAddr;

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// From in-memory rule lookups up to the upstream timeout.
#[cfg(feature = "prometheus")]
const CHECK_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0,
];

/// Exporter configuration.
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Scrape endpoint address.
    pub listen: SocketAddr,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 9153).into(),
        }
    }
}

/// Installs the global recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn init_prometheus(config: &PrometheusConfig) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            CHECK_BUCKETS,
        )?
        .install()?;

    describe();
    tracing::info!(listen = %config.listen, "Prometheus exporter listening");
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_prometheus(_config: &PrometheusConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("Built without the prometheus feature; metrics are not exported");
    Ok(())
}

#[cfg(feature = "prometheus")]
fn describe() {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    describe_counter!("sift_checks_total", "Host checks by verdict reason");
    describe_histogram!(
        "sift_check_duration_seconds",
        Unit::Seconds,
        "Time to reach a verdict"
    );
    describe_gauge!("sift_rules_loaded", "Rules in the active rule set");
    describe_counter!("sift_reloads_total", "Completed rule set rebuilds");
    describe_histogram!(
        "sift_reload_duration_seconds",
        Unit::Seconds,
        "Rule set rebuild time"
    );
    describe_counter!(
        "sift_reputation_requests_total",
        "Reputation requests sent upstream"
    );
    describe_counter!(
        "sift_reputation_cache_hits_total",
        "Reputation lookups answered from cache"
    );
    describe_counter!(
        "sift_reputation_failures_total",
        "Reputation lookups that failed open"
    );
    describe_gauge!(
        "sift_reputation_pending",
        "Reputation requests in flight"
    );
}
