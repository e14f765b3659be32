//! Error types surfaced by the forwarding paths.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::resilience::admission::Overloaded;

/// Errors that end a client request.
#[derive(Debug, Error)]
pub enum IngressError {
    /// Admission shed the request or its queue wait expired.
    #[error("ingress overloaded")]
    Overloaded(#[from] Overloaded),

    #[error("payload too large")]
    PayloadTooLarge { limit: usize },

    /// The client body could not be read.
    #[error("{0}")]
    InvalidRequest(String),

    /// Every node failed at the transport level; carries the last failure.
    #[error("all upstream nodes failed: {0}")]
    AllNodesExhausted(String),
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            IngressError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngressError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IngressError::AllNodesExhausted(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// A failed attempt against one node. Triggers failover, never reaches the
/// client on its own.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream closed")]
    Closed,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Client(String),
}

impl TransportError {
    /// Flatten a client error and its sources into one message.
    pub fn from_client(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        TransportError::Client(message)
    }
}
