//! Sticky affinity inputs and the affinity cookie.
//!
//! A request can carry three affinity signals, consulted in priority order:
//! the affinity cookie (a node id), the bearer token and the client address.
//! The last two are hashed onto a node index with 32-bit FNV-1a, so the same
//! token or address keeps landing on the same node.

use std::collections::HashMap;
use std::net::IpAddr;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;

use crate::config::AffinityConfig;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// The affinity-relevant parts of a request, extracted once at ingress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingHints {
    /// Decoded, trimmed affinity cookie value (never empty).
    pub affinity_cookie: Option<String>,
    /// Bearer token from `Authorization` (never empty).
    pub bearer_token: Option<String>,
    /// Address of the connected client.
    pub remote_addr: Option<IpAddr>,
}

impl RoutingHints {
    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<IpAddr>, cookie_name: &str) -> Self {
        let cookies = parse_cookies(headers);
        Self {
            affinity_cookie: cookies
                .get(cookie_name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            bearer_token: extract_bearer_token(headers),
            remote_addr,
        }
    }

    /// Whether the client presented the affinity cookie at all.
    pub fn has_affinity_cookie(&self) -> bool {
        self.affinity_cookie.is_some()
    }
}

/// Parse every `Cookie` header into a name → decoded value map.
/// Later duplicates win; values that fail to decode are kept raw.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let raw = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(";");

    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let decoded = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        out.insert(key.to_string(), decoded);
    }
    out
}

/// Token from `Authorization: Bearer <token>`, if present and non-empty.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get_all(AUTHORIZATION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(",");
    raw.strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// 32-bit FNV-1a over the UTF-16 code units of `text`.
pub fn fnv1a(text: &str) -> u32 {
    text.encode_utf16().fold(FNV_OFFSET, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    })
}

/// Map `text` onto `0..len`.
pub fn hash_to_index(text: &str, len: usize) -> usize {
    fnv1a(text) as usize % len.max(1)
}

/// Build the `Set-Cookie` value pinning a client to `node_id`.
pub fn affinity_cookie_header(config: &AffinityConfig, node_id: &str) -> String {
    let mut parts = vec![
        format!(
            "{}={}",
            config.cookie_name,
            urlencoding::encode(node_id)
        ),
        "Path=/".to_string(),
        format!("Max-Age={}", config.cookie_max_age_secs),
        "HttpOnly".to_string(),
        format!("SameSite={}", config.cookie_same_site),
    ];
    if config.cookie_secure {
        parts.push("Secure".to_string());
    }
    parts.join("; ")
}
