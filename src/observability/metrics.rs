//! Metrics collection and exposition.
//!
//! # Metrics
//! - `nest_proxy_requests_total` (counter): device calls by endpoint, status
//! - `nest_proxy_request_duration_seconds` (histogram): latency by endpoint
//! - `nest_proxy_denied_total` (counter): admission denials by reason
//! - `nest_proxy_upstream_errors_total` (counter): upstream failures by kind
//! - `nest_proxy_active_streams` (gauge): open subscriptions
//! - `nest_proxy_streams_closed_total` (counter): finished subscriptions by outcome
//! - `nest_proxy_traffic_dropped_total` (counter): traffic records dropped
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(endpoint: &'static str, status: u16, start: Instant) {
    counter!(
        "nest_proxy_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("nest_proxy_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_denied(reason: &'static str) {
    counter!("nest_proxy_denied_total", "reason" => reason).increment(1);
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("nest_proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn stream_opened() {
    gauge!("nest_proxy_active_streams").increment(1.0);
}

pub fn stream_closed(outcome: &'static str) {
    gauge!("nest_proxy_active_streams").decrement(1.0);
    counter!("nest_proxy_streams_closed_total", "outcome" => outcome).increment(1);
}

pub fn record_traffic_dropped() {
    counter!("nest_proxy_traffic_dropped_total").increment(1);
}
