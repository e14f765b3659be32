//! Startup orchestration.
//!
//! # Responsibilities
//! - Install logging and (optionally) the metrics exporter
//! - Announce the upstream list and routing mode
//!
//! Listeners bind last, after everything here has run.

use std::net::SocketAddr;

use crate::config::IngressConfig;
use crate::http::IngressState;
use crate::observability::{logging, metrics};

/// Install the tracing subscriber and, when enabled, the Prometheus exporter.
/// Must run inside the Tokio runtime.
pub fn init_observability(config: &IngressConfig) {
    logging::init(&config.observability);

    if !config.observability.metrics_enabled {
        return;
    }
    match config.observability.metrics_address.parse::<SocketAddr>() {
        Ok(addr) => metrics::init_metrics(addr),
        Err(e) => tracing::error!(
            metrics_address = %config.observability.metrics_address,
            error = %e,
            "Failed to parse metrics address"
        ),
    }
}

/// Log the effective routing setup.
pub fn announce(state: &IngressState) {
    let config = &state.config;
    let mode = if config.affinity.sticky_enabled {
        "sticky"
    } else {
        "least-loaded"
    };

    tracing::info!(
        upstreams = %state.registry.describe(),
        mode,
        affinity_cookie = config.affinity.sticky_enabled && config.affinity.cookie_enabled,
        "Upstream nodes configured"
    );
    tracing::info!(
        timeout_ms = config.upstream.timeout_ms,
        max_body_bytes = config.upstream.max_body_bytes,
        max_inflight = config.admission.max_inflight,
        max_queue = config.admission.max_queue,
        queue_timeout_ms = config.admission.queue_timeout_ms,
        failure_threshold = config.circuit_breaker.failure_threshold,
        cooldown_ms = config.circuit_breaker.cooldown_ms,
        "Ingress limits"
    );
}
