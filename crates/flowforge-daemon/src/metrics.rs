//! Prometheus metrics for the control plane.
//!
//! Request, auth, and lifecycle counters live in a `prometheus`
//! registry; the `/metrics` handler encodes the registry and appends
//! computed gauge sections for the idempotency replay cache, decision
//! replay integrity, and signal-baseline health, which are derived from
//! the ledger at scrape time.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Stop SLO target, seconds.
pub const STOP_SLO_TARGET_SECONDS: f64 = 3.0;
/// Restart SLO target, seconds.
pub const RESTART_SLO_TARGET_SECONDS: f64 = 5.0;

/// Bound on label values to keep hostile paths from exploding series.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Latency buckets for lifecycle operations, seconds.
const LIFECYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0];

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration failed (e.g. duplicate name).
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Encoding the registry failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Control-plane metrics registry.
pub struct ControlPlaneMetrics {
    registry: Registry,

    requests_total: CounterVec,
    auth_failures_total: IntCounter,
    process_kills_total: IntCounter,
    process_restarts_total: IntCounter,
    worker_active: IntGauge,

    stop_duration: Histogram,
    restart_duration: Histogram,
    stop_slo_compliance: Gauge,
    restart_slo_compliance: Gauge,

    stop_counts: std::sync::Mutex<SloCounts>,
    restart_counts: std::sync::Mutex<SloCounts>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SloCounts {
    total: u64,
    within: u64,
}

impl SloCounts {
    fn ratio(self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.within as f64 / self.total as f64
        }
    }
}

impl ControlPlaneMetrics {
    /// Creates the registry with all families registered.
    ///
    /// # Panics
    ///
    /// Registration of the built-in families cannot collide; a failure
    /// here is a programming error.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("flowforge_http_requests_total", "HTTP requests served"),
            &["path", "method", "status"],
        )
        .expect("requests_total opts");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");

        let auth_failures_total = IntCounter::new(
            "flowforge_auth_failures_total",
            "Rejected authentication attempts",
        )
        .expect("auth_failures opts");
        registry
            .register(Box::new(auth_failures_total.clone()))
            .expect("register auth_failures");

        let process_kills_total = IntCounter::new(
            "flowforge_process_kills_total",
            "Operator kill requests accepted",
        )
        .expect("kills opts");
        registry
            .register(Box::new(process_kills_total.clone()))
            .expect("register kills");

        let process_restarts_total = IntCounter::new(
            "flowforge_process_restarts_total",
            "Operator restart requests accepted",
        )
        .expect("restarts opts");
        registry
            .register(Box::new(process_restarts_total.clone()))
            .expect("register restarts");

        let worker_active = IntGauge::new(
            "flowforge_worker_active",
            "Whether a supervised worker is currently active",
        )
        .expect("worker_active opts");
        registry
            .register(Box::new(worker_active.clone()))
            .expect("register worker_active");

        let stop_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowforge_lifecycle_stop_duration_seconds",
                "Observed stop latency",
            )
            .buckets(LIFECYCLE_BUCKETS.to_vec()),
        )
        .expect("stop histogram opts");
        registry
            .register(Box::new(stop_duration.clone()))
            .expect("register stop histogram");

        let restart_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowforge_lifecycle_restart_duration_seconds",
                "Observed restart latency",
            )
            .buckets(LIFECYCLE_BUCKETS.to_vec()),
        )
        .expect("restart histogram opts");
        registry
            .register(Box::new(restart_duration.clone()))
            .expect("register restart histogram");

        let stop_slo_target = Gauge::new(
            "flowforge_stop_slo_target_seconds",
            "Stop SLO target in seconds",
        )
        .expect("stop slo opts");
        stop_slo_target.set(STOP_SLO_TARGET_SECONDS);
        registry
            .register(Box::new(stop_slo_target.clone()))
            .expect("register stop slo");

        let restart_slo_target = Gauge::new(
            "flowforge_restart_slo_target_seconds",
            "Restart SLO target in seconds",
        )
        .expect("restart slo opts");
        restart_slo_target.set(RESTART_SLO_TARGET_SECONDS);
        registry
            .register(Box::new(restart_slo_target.clone()))
            .expect("register restart slo");

        let stop_slo_compliance = Gauge::new(
            "flowforge_stop_slo_compliance_ratio",
            "Share of stops finishing within the SLO target",
        )
        .expect("stop compliance opts");
        stop_slo_compliance.set(1.0);
        registry
            .register(Box::new(stop_slo_compliance.clone()))
            .expect("register stop compliance");

        let restart_slo_compliance = Gauge::new(
            "flowforge_restart_slo_compliance_ratio",
            "Share of restarts finishing within the SLO target",
        )
        .expect("restart compliance opts");
        restart_slo_compliance.set(1.0);
        registry
            .register(Box::new(restart_slo_compliance.clone()))
            .expect("register restart compliance");

        Self {
            registry,
            requests_total,
            auth_failures_total,
            process_kills_total,
            process_restarts_total,
            worker_active,
            stop_duration,
            restart_duration,
            stop_slo_compliance,
            restart_slo_compliance,
            stop_counts: std::sync::Mutex::new(SloCounts::default()),
            restart_counts: std::sync::Mutex::new(SloCounts::default()),
        }
    }

    /// Counts one served request.
    pub fn inc_request(&self, path: &str, method: &str, status: u16) {
        self.requests_total
            .with_label_values(&[
                truncate_label(path),
                truncate_label(method),
                &status.to_string(),
            ])
            .inc();
    }

    /// Counts one auth failure.
    pub fn inc_auth_failure(&self) {
        self.auth_failures_total.inc();
    }

    /// Counts one accepted kill.
    pub fn inc_process_kill(&self) {
        self.process_kills_total.inc();
    }

    /// Counts one accepted restart.
    pub fn inc_process_restart(&self) {
        self.process_restarts_total.inc();
    }

    /// Publishes whether a worker is active.
    pub fn set_worker_active(&self, active: bool) {
        self.worker_active.set(i64::from(active));
    }

    /// Records a completed stop and refreshes the compliance ratio.
    pub fn observe_stop(&self, seconds: f64) {
        self.stop_duration.observe(seconds);
        let mut counts = self.stop_counts.lock().unwrap();
        counts.total += 1;
        if seconds <= STOP_SLO_TARGET_SECONDS {
            counts.within += 1;
        }
        self.stop_slo_compliance.set(counts.ratio());
    }

    /// Records a completed restart and refreshes the compliance ratio.
    pub fn observe_restart(&self, seconds: f64) {
        self.restart_duration.observe(seconds);
        let mut counts = self.restart_counts.lock().unwrap();
        counts.total += 1;
        if seconds <= RESTART_SLO_TARGET_SECONDS {
            counts.within += 1;
        }
        self.restart_slo_compliance.set(counts.ratio());
    }

    /// Encodes the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Fails when the encoder rejects the gathered families.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    /// Current auth failure count (test support).
    #[must_use]
    pub fn auth_failure_count(&self) -> u64 {
        self.auth_failures_total.get()
    }
}

impl Default for ControlPlaneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<ControlPlaneMetrics>;

/// Truncates a label value at a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // counters return exact integer values as f64
mod tests {
    use super::*;

    #[test]
    fn registry_encodes_all_families() {
        let metrics = ControlPlaneMetrics::new();
        metrics.inc_request("/v1/incidents", "GET", 200);
        metrics.inc_auth_failure();
        metrics.inc_process_kill();
        metrics.inc_process_restart();
        metrics.set_worker_active(true);
        metrics.observe_stop(0.4);
        metrics.observe_restart(1.2);

        let text = metrics.encode_text().unwrap();
        for family in [
            "flowforge_http_requests_total",
            "flowforge_auth_failures_total",
            "flowforge_process_kills_total",
            "flowforge_process_restarts_total",
            "flowforge_worker_active",
            "flowforge_lifecycle_stop_duration_seconds",
            "flowforge_lifecycle_restart_duration_seconds",
            "flowforge_stop_slo_target_seconds 3",
            "flowforge_restart_slo_target_seconds 5",
            "flowforge_stop_slo_compliance_ratio",
            "flowforge_restart_slo_compliance_ratio",
        ] {
            assert!(text.contains(family), "missing {family} in:\n{text}");
        }
    }

    #[test]
    fn slo_compliance_tracks_breaches() {
        let metrics = ControlPlaneMetrics::new();
        metrics.observe_stop(1.0);
        metrics.observe_stop(10.0);
        let text = metrics.encode_text().unwrap();
        assert!(
            text.contains("flowforge_stop_slo_compliance_ratio 0.5"),
            "{text}"
        );
    }

    #[test]
    fn label_truncation_is_utf8_safe() {
        let metrics = ControlPlaneMetrics::new();
        let long = "\u{1F600}".repeat(40);
        metrics.inc_request(&long, "GET", 200);
        assert!(metrics.encode_text().is_ok());
    }
}
