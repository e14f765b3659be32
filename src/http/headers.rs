//! Header manipulation for proxied requests and responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Keep `Upgrade` (and re-assert `Connection: Upgrade`) on upgrade requests
//! - Append X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Rewrite `Host` to the chosen node

use std::net::IpAddr;

use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, UPGRADE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::load_balancer::node::UpstreamNode;

/// Headers that describe a single connection leg.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Which of the two forwarding paths a request takes. Decided once at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    ProtocolUpgrade,
}

impl RequestKind {
    /// An upgrade request names `upgrade` in `Connection` and carries `Upgrade`.
    pub fn of(headers: &HeaderMap) -> Self {
        let wants_upgrade = connection_tokens(headers).iter().any(|t| t == "upgrade");
        if wants_upgrade && headers.contains_key(UPGRADE) {
            RequestKind::ProtocolUpgrade
        } else {
            RequestKind::Standard
        }
    }
}

/// Lowercased, trimmed tokens of every `Connection` header.
pub fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Remove hop-by-hop headers and anything named by `Connection`.
/// With `keep_upgrade`, `Upgrade` survives and `Connection` is reduced to
/// the upgrade token.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let tokens = connection_tokens(headers);

    for token in &tokens {
        if keep_upgrade && token == "upgrade" {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    if keep_upgrade {
        let kept: Vec<&str> = tokens
            .iter()
            .filter(|t| *t == "upgrade")
            .map(String::as_str)
            .collect();
        let value = if kept.is_empty() {
            "Upgrade".to_string()
        } else {
            kept.join(", ")
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(CONNECTION, value);
        }
    } else {
        headers.remove(UPGRADE);
    }
}

/// Append forwarding headers describing the client leg.
pub fn append_forwarded(headers: &mut HeaderMap, remote: Option<IpAddr>, original_host: Option<&HeaderValue>) {
    if let Some(remote) = remote {
        let previous = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        let value = if previous.is_empty() {
            remote.to_string()
        } else {
            format!("{}, {}", previous, remote)
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
}

/// Headers for a buffered request to `node`.
pub fn upstream_request_headers(
    parts: &Parts,
    node: &UpstreamNode,
    remote: Option<IpAddr>,
    body_len: usize,
) -> HeaderMap {
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers, false);
    set_host(&mut headers, node);
    append_forwarded(&mut headers, remote, parts.headers.get(HOST));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    headers
}

/// Headers for an upgrade handshake to `node`. `Upgrade` is kept and
/// `Connection` reduced to the upgrade token.
pub fn upgrade_request_headers(
    parts: &Parts,
    node: &UpstreamNode,
    remote: Option<IpAddr>,
    body_len: usize,
) -> HeaderMap {
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers, true);
    set_host(&mut headers, node);
    append_forwarded(&mut headers, remote, parts.headers.get(HOST));
    if body_len > 0 {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    } else {
        headers.remove(CONTENT_LENGTH);
    }
    headers
}

/// Strip hop-by-hop headers from an upstream response.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers, false);
}

fn set_host(headers: &mut HeaderMap, node: &UpstreamNode) {
    if let Ok(value) = HeaderValue::from_str(&node.authority()) {
        headers.insert(HOST, value);
    }
}
