//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here:
//!
//! - `gateway_requests_total` (counter): labels `status`, `plan`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//!
//! The pool crate records `pool_grants_total`, `pool_saturated_total`,
//! `pool_acquire_wait_seconds` and `generation_attempts_total` through the
//! same global recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// From 5ms (fast 400/404 rejections) up to the 600s upstream timeout;
/// requests may also wait on the pool for minutes, which lands in `+Inf`.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("histogram buckets are non-empty")
}

/// Install the Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished generate request.
pub fn record_request(status: u16, plan: &str, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status.clone(), "plan" => plan.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status).record(duration_secs);
}
