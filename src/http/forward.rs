//! Buffered HTTP forwarding with failover.
//!
//! # Data Flow
//! ```text
//! client request
//!     → buffer body (≤ max_body_bytes)
//!     → attempt order from the planner
//!     → for each node: send through the pool
//!         headers received  → close circuit, stream response back
//!         transport failure → mark failure, next node
//!     → none left → 502
//! ```

use std::net::IpAddr;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, Uri, Version};
use axum::response::Response;
use futures_util::StreamExt;

use crate::http::error::{IngressError, TransportError};
use crate::http::headers::{sanitize_response_headers, upstream_request_headers};
use crate::http::server::IngressState;
use crate::load_balancer::affinity::RoutingHints;
use crate::load_balancer::node::UpstreamNode;
use crate::observability::metrics;

/// Proxy a standard request, trying nodes in planner order until one answers.
pub async fn forward_http(
    state: &IngressState,
    request: Request<Body>,
    remote: Option<IpAddr>,
    request_id: &str,
) -> Result<Response, IngressError> {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();
    let body = read_body(body, &parts.headers, state.config.upstream.max_body_bytes).await?;

    let hints = RoutingHints::from_headers(
        &parts.headers,
        remote,
        &state.planner.affinity().cookie_name,
    );
    let plan = state
        .planner
        .attempt_order(&hints, &state.registry, &state.breaker);

    let mut last_error: Option<TransportError> = None;

    for (attempt, &index) in plan.order.iter().enumerate() {
        let Some(node) = state.registry.get(index) else {
            continue;
        };

        let call = node.begin_call();
        let upstream = upstream_request(&parts, node, remote, body.clone())?;

        match state.client.send(index, upstream).await {
            Ok(mut response) => {
                state.breaker.mark_success(node);
                drop(call);

                sanitize_response_headers(response.headers_mut());
                if let Some(cookie) = state.planner.cookie_for_attempt(&plan, node, attempt) {
                    if let Ok(value) = HeaderValue::from_str(&cookie) {
                        response.headers_mut().append(SET_COOKIE, value);
                    }
                }

                tracing::debug!(
                    request_id = %request_id,
                    node = %node.id,
                    attempt,
                    status = response.status().as_u16(),
                    "Upstream responded"
                );
                metrics::record_request(&method, response.status().as_u16(), &node.id, start);
                return Ok(response);
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    node = %node.id,
                    attempt,
                    error = %err,
                    "Upstream attempt failed"
                );
                state.breaker.mark_failure(node);
                metrics::record_upstream_failure(&node.id);
                last_error = Some(err);
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no upstream nodes".to_string());
    tracing::error!(request_id = %request_id, reason = %reason, "All upstream nodes failed");
    metrics::record_request(&method, 502, "none", start);
    Err(IngressError::AllNodesExhausted(reason))
}

/// Buffer the whole request body, refusing anything over `limit` bytes.
pub async fn read_body(body: Body, headers: &HeaderMap, limit: usize) -> Result<Bytes, IngressError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(IngressError::PayloadTooLarge { limit });
    }

    let mut buffer = Vec::with_capacity(declared.unwrap_or(0) as usize);
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| IngressError::InvalidRequest(format!("failed to read request body: {}", e)))?;
        if buffer.len() + chunk.len() > limit {
            return Err(IngressError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(buffer))
}

fn upstream_request(
    parts: &Parts,
    node: &UpstreamNode,
    remote: Option<IpAddr>,
    body: Bytes,
) -> Result<Request<Body>, IngressError> {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{}{}", node.authority(), target)
        .parse()
        .map_err(|e| IngressError::InvalidRequest(format!("invalid upstream uri: {}", e)))?;
    let headers = upstream_request_headers(parts, node, remote, body.len());

    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}
