//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (axum::serve)
//!     → server.rs (request ID, tracing, admission, dispatch by RequestKind)
//!     → forward.rs (buffered requests, failover through the pool in client.rs)
//!     → upgrade.rs (handshake failover, then a byte relay)
//!     → headers.rs (hop-by-hop stripping, forwarding headers) on every leg
//! ```

pub mod client;
pub mod error;
pub mod forward;
pub mod headers;
pub mod server;
pub mod upgrade;

pub use error::{IngressError, TransportError};
pub use server::{HealthReport, IngressServer, IngressState, X_REQUEST_ID};
