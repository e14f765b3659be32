//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the ingress.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::nodes::NodeConfig;

/// Root configuration for the ingress.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct IngressConfig {
    /// Listener configuration (bind host and port).
    pub listener: ListenerConfig,

    /// Upstream node list, timeout and body limit.
    pub upstream: UpstreamConfig,

    /// Sticky routing and affinity cookie settings.
    pub affinity: AffinityConfig,

    /// Per-node circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Admission control (inflight bound and wait queue).
    pub admission: AdmissionConfig,

    /// Upstream connection pool settings.
    pub pool: PoolConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host or IP to bind (e.g., "0.0.0.0").
    pub host: String,

    /// TCP port to bind.
    pub port: u16,
}

impl ListenerConfig {
    /// The `host:port` string handed to the TCP listener.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Upstream cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Static node list, each entry written as `id@host:port`.
    #[serde(deserialize_with = "crate::config::nodes::deserialize_nodes")]
    pub nodes: Vec<NodeConfig>,

    /// Timeout for a single upstream attempt in milliseconds.
    pub timeout_ms: u64,

    /// Maximum buffered request body in bytes.
    pub max_body_bytes: usize,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            timeout_ms: 1500,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// SameSite attribute written on the affinity cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum SameSite {
    Strict,
    None,
    #[default]
    Lax,
}

impl SameSite {
    /// Case-insensitive parse; anything unrecognised becomes `Lax`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => SameSite::Strict,
            "none" => SameSite::None,
            _ => SameSite::Lax,
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SameSite::Strict => "Strict",
            SameSite::None => "None",
            SameSite::Lax => "Lax",
        };
        f.write_str(value)
    }
}

/// Sticky routing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Prefer the same node for the same cookie/token/client address.
    pub sticky_enabled: bool,

    /// Issue the affinity cookie on responses.
    pub cookie_enabled: bool,

    /// Name of the affinity cookie.
    pub cookie_name: String,

    /// `Max-Age` attribute in seconds.
    pub cookie_max_age_secs: i64,

    /// `SameSite` attribute.
    pub cookie_same_site: SameSite,

    /// Add the `Secure` attribute.
    pub cookie_secure: bool,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            sticky_enabled: false,
            cookie_enabled: false,
            cookie_name: "RDB_INGRESS_AFFINITY".to_string(),
            cookie_max_age_secs: 7 * 24 * 60 * 60,
            cookie_same_site: SameSite::Lax,
            cookie_secure: false,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transport failures that open the circuit.
    pub failure_threshold: u32,

    /// How long an opened circuit stays open, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 6,
            cooldown_ms: 800,
        }
    }
}

/// Admission control configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum concurrently proxied requests.
    pub max_inflight: usize,

    /// Maximum requests waiting for a slot.
    pub max_queue: usize,

    /// How long a queued request may wait, in milliseconds.
    pub queue_timeout_ms: u64,
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1200,
            max_queue: 2400,
            queue_timeout_ms: 60,
        }
    }
}

/// Upstream connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reuse upstream connections between requests.
    pub keep_alive: bool,

    /// TCP keepalive interval for pooled sockets, in milliseconds.
    pub keep_alive_ms: u64,

    /// Maximum concurrent upstream connections per node.
    pub max_sockets: usize,

    /// Maximum idle pooled connections per node.
    pub max_free_sockets: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_ms: 1000,
            max_sockets: 4096,
            max_free_sockets: 512,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable the Prometheus metrics listener.
    pub metrics_enabled: bool,

    /// Address for the metrics listener.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "ingress_proxy=info,tower_http=info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
