//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! listener.rs   bind the public socket, hand it to axum::serve
//! connection.rs track upgraded connections until they close
//! ```

pub mod connection;
pub mod listener;
