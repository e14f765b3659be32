//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ingress_requests_total` (counter): proxied requests by method, status, node
//! - `ingress_request_duration_seconds` (histogram): end-to-end latency
//! - `ingress_upstream_failures_total` (counter): transport failures by node
//! - `ingress_circuit_opened_total` (counter): breaker trips by node
//! - `ingress_admission_rejected_total` (counter): shed / queue timeouts
//! - `ingress_upgrade_relays_active` (gauge): open upgrade relays

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `addr`. Must run inside the runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, node: &str, start: Instant) {
    counter!(
        "ingress_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "node" => node.to_string()
    )
    .increment(1);
    histogram!("ingress_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_failure(node: &str) {
    counter!("ingress_upstream_failures_total", "node" => node.to_string()).increment(1);
}

pub fn record_circuit_opened(node: &str) {
    counter!("ingress_circuit_opened_total", "node" => node.to_string()).increment(1);
}

pub fn record_admission_rejected(reason: &'static str) {
    counter!("ingress_admission_rejected_total", "reason" => reason).increment(1);
}

pub fn relay_opened() {
    gauge!("ingress_upgrade_relays_active").increment(1.0);
}

pub fn relay_closed() {
    gauge!("ingress_upgrade_relays_active").decrement(1.0);
}
