//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults (schema.rs)
//!     → optional TOML file (loader.rs)
//!     → INGRESS_* environment overrides (loader.rs, nodes.rs)
//!     → validation.rs (semantic checks, all errors collected)
//!     → IngressConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the node list is static for the process
//! - All fields have defaults to allow minimal configs
//! - Environment lookups go through a closure so tests never touch process env

pub mod loader;
pub mod nodes;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use nodes::{parse_node, parse_nodes, NodeConfig};
pub use schema::{
    AdmissionConfig, AffinityConfig, CircuitBreakerConfig, IngressConfig, ListenerConfig,
    ObservabilityConfig, PoolConfig, SameSite, UpstreamConfig,
};
