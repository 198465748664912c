//! Prometheus metrics exposition
//!
//! Request metrics are recorded here; the rotation engine records
//! `code_rotations_total`, `codes_recycled_total` and the pool gauges itself.
//!
//! - `code_requests_total` (counter): labels `route`, `outcome`
//! - `code_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "code_request_duration_seconds";

/// Requests only touch the store, so buckets stop at 5 s.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("histogram bucket list is non-empty")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration histogram gets explicit buckets so it renders `_bucket`
/// lines instead of a summary.
pub fn install_recorder() -> PrometheusHandle {
    let handle = builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

fn describe() {
    metrics::describe_counter!("code_requests_total", "Requests by route and outcome");
    metrics::describe_histogram!(DURATION_METRIC, "Request handling time");
    metrics::describe_counter!("code_rotations_total", "New codes drawn, by page");
    metrics::describe_counter!("codes_recycled_total", "Codes returned to the pool");
    metrics::describe_gauge!("codes_available", "Codes free to draw");
    metrics::describe_gauge!("codes_cooling_down", "Codes waiting out their cool-down");
}

/// Record a finished request.
pub fn record_request(route: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("code_requests_total", "route" => route, "outcome" => outcome).increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
