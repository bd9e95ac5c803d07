//! Prometheus metrics exposition
//!
//! Gateway-level series recorded here:
//!
//! - `gateway_requests_total` (counter): labels `status`, `mode`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//!
//! `relay_attempts_total` and `pool_transitions_total` are emitted by the
//! relay and cookie-pool crates through the same global recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// From 50ms up to the default 600s upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration series renders as a histogram (`_bucket` lines) rather than
/// the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Whether the request asked for a streamed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    Buffered,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Stream => "stream",
            Mode::Buffered => "buffered",
        }
    }
}

/// Record a completed chat request.
pub fn record_request(status: u16, mode: Mode, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "mode" => mode.label())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}
