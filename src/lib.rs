//! HTTP/WebSocket ingress: a reverse proxy in front of a fixed set of
//! application nodes, with admission control, per-node circuit breaking,
//! least-loaded/sticky routing and transport-level failover.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::IngressConfig;
pub use http::IngressServer;
pub use lifecycle::Shutdown;
