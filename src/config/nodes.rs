//! Upstream node list parsing.
//!
//! Entries are written `id@host:port`, comma-separated in environment
//! variables or as an array of strings in the config file. The id is optional
//! (`host:port` becomes `node-<position>`), the `http://` scheme is optional and
//! the port defaults to 80. Entries that cannot be parsed are skipped, and
//! duplicates of an already-seen `host:port` keep the first occurrence.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// A single statically configured upstream node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// The `host:port` authority used for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

impl Serialize for NodeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parse one node entry. `index` is the entry's position in its list and
/// only feeds the generated id.
pub fn parse_node(raw: &str, index: usize) -> Option<NodeConfig> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut id = format!("node-{}", index + 1);
    let mut endpoint = raw;
    if let Some((name, rest)) = raw.split_once('@') {
        let name = name.trim();
        if !name.is_empty() {
            id = name.to_string();
        }
        endpoint = rest.trim();
    }
    if endpoint.is_empty() {
        return None;
    }

    let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Url::parse(endpoint)
    } else {
        Url::parse(&format!("http://{}", endpoint))
    }
    .ok()?;

    if url.scheme() != "http" {
        return None;
    }
    let host = url.host_str().filter(|h| !h.is_empty())?;
    let port = url.port_or_known_default().unwrap_or(80);
    if port == 0 {
        return None;
    }

    Some(NodeConfig::new(id, host, port))
}

/// Parse a comma-separated node list, skipping invalid entries and
/// dropping duplicate endpoints.
pub fn parse_nodes(raw: &str) -> Vec<NodeConfig> {
    let parsed = raw
        .split(',')
        .enumerate()
        .filter_map(|(index, entry)| parse_node(entry, index))
        .collect();
    dedup_endpoints(parsed)
}

/// Keep the first node for every distinct `host:port`.
pub fn dedup_endpoints(nodes: Vec<NodeConfig>) -> Vec<NodeConfig> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| {
            let fresh = seen.insert(node.authority());
            if !fresh {
                tracing::warn!(node = %node, "Dropping duplicate upstream endpoint");
            }
            fresh
        })
        .collect()
}

/// Derive application-server nodes from a storage cluster list by shifting
/// every port by `kvs_port - server_port`. Non-positive ports are dropped.
pub fn derive_from_cluster(raw: &str, kvs_port: i64, server_port: i64) -> Vec<NodeConfig> {
    let delta = kvs_port - server_port;
    parse_nodes(raw)
        .into_iter()
        .filter_map(|node| {
            let port = i64::from(node.port) - delta;
            u16::try_from(port)
                .ok()
                .filter(|p| *p > 0)
                .map(|port| NodeConfig { port, ..node })
        })
        .collect()
}

/// Serde adapter for `upstream.nodes = ["id@host:port", ...]`.
pub fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Vec<NodeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<String>::deserialize(deserializer)?;
    let mut nodes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match parse_node(entry, index) {
            Some(node) => nodes.push(node),
            None => {
                return Err(serde::de::Error::custom(format!(
                    "invalid upstream node entry: {:?}",
                    entry
                )))
            }
        }
    }
    Ok(nodes)
}
