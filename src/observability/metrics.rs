//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method and status
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_body_chunks_total` / `proxy_body_bytes_total` (counters): relayed body parts
//! - `proxy_upstream_errors_total` (counter): upstream failures by stage
//! - `proxy_recordings_persisted_total` (counter): recording writes by outcome
//! - `proxy_replay_verifications_total` (counter): verification replays by outcome

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Count a proxied request once its response head is known.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_body_chunk(len: usize) {
    counter!("proxy_body_chunks_total").increment(1);
    counter!("proxy_body_bytes_total").increment(len as u64);
}

/// `stage` is `"connect"` before the head arrived, `"stream"` after.
pub fn record_upstream_error(stage: &'static str) {
    counter!("proxy_upstream_errors_total", "stage" => stage).increment(1);
}

pub fn record_persisted(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("proxy_recordings_persisted_total", "outcome" => outcome).increment(1);
}

pub fn record_verification(matched: bool) {
    let outcome = if matched { "match" } else { "mismatch" };
    counter!("proxy_replay_verifications_total", "outcome" => outcome).increment(1);
}
