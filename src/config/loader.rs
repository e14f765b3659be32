//! Configuration loading from disk and environment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::nodes::{dedup_endpoints, derive_from_cluster, parse_nodes};
use crate::config::schema::{IngressConfig, SameSite};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration: defaults, then the optional TOML file, then the
/// process environment backed by an optional `.env` file. The result is
/// validated before it is returned.
pub fn load_config(path: Option<&Path>) -> Result<IngressConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        }
        None => IngressConfig::default(),
    };

    let dotenv = match find_env_file() {
        Some(path) => parse_env_file(&fs::read_to_string(path)?),
        None => HashMap::new(),
    };
    apply_env_overrides(
        &mut config,
        with_env_file(|key| std::env::var(key).ok(), &dotenv),
    );
    config.upstream.nodes = dedup_endpoints(std::mem::take(&mut config.upstream.nodes));

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// `ENV_PATH` if set, otherwise the first `.env` found beside the binary,
/// in its parent directory, or in the working directory.
pub fn find_env_file() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("ENV_PATH").filter(|p| !p.is_empty()) {
        let explicit = PathBuf::from(explicit);
        return explicit.is_file().then_some(explicit);
    }

    let mut candidates = Vec::new();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(dir.join(".env"));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(".env"));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(".env"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

/// Parse `KEY=value` lines. Blank lines, `#` comments and lines without a
/// key are skipped; an `export ` prefix and one pair of matching outer
/// quotes are removed. The first definition of a key wins.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let quoted = value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')));
        let value = if quoted { &value[1..value.len() - 1] } else { value };
        vars.entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
    vars
}

/// Look a variable up in `process` first, then in the `.env` values.
/// A variable present in the process, even empty, hides the file's value.
pub fn with_env_file<'a, F>(
    process: F,
    file: &'a HashMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a
where
    F: Fn(&str) -> Option<String> + 'a,
{
    move |key| process(key).or_else(|| file.get(key).cloned())
}

/// Overlay `INGRESS_*` variables (and the cluster node fallbacks) onto
/// `config`. Unset or unparseable values leave the current setting alone.
pub fn apply_env_overrides<F>(config: &mut IngressConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let int = |key: &str| var(key).and_then(|v| parse_int(&v));
    let positive = |key: &str| int(key).filter(|n| *n > 0);
    let flag = |key: &str| var(key).and_then(|v| parse_bool(&v));

    if let Some(host) = var("INGRESS_HOST") {
        config.listener.host = host;
    }
    if let Some(port) = int("INGRESS_PORT").and_then(|p| u16::try_from(p).ok()) {
        config.listener.port = port;
    }

    let nodes = resolve_env_nodes(&var);
    if !nodes.is_empty() {
        config.upstream.nodes = nodes;
    }
    if let Some(ms) = positive("INGRESS_UPSTREAM_TIMEOUT_MS") {
        config.upstream.timeout_ms = ms as u64;
    }
    if let Some(bytes) = positive("INGRESS_MAX_BODY_BYTES") {
        config.upstream.max_body_bytes = bytes as usize;
    }

    let affinity = &mut config.affinity;
    if let Some(enabled) = flag("INGRESS_STICKY_ENABLED") {
        affinity.sticky_enabled = enabled;
    }
    if let Some(enabled) = flag("INGRESS_AFFINITY_COOKIE_ENABLED") {
        affinity.cookie_enabled = enabled;
    }
    if let Some(name) = var("INGRESS_AFFINITY_COOKIE") {
        affinity.cookie_name = name;
    }
    if let Some(secs) = int("INGRESS_AFFINITY_MAX_AGE_SEC") {
        affinity.cookie_max_age_secs = secs;
    }
    if let Some(same_site) = var("INGRESS_AFFINITY_SAMESITE") {
        affinity.cookie_same_site = SameSite::normalize(&same_site);
    }
    if let Some(secure) = flag("INGRESS_AFFINITY_SECURE") {
        affinity.cookie_secure = secure;
    }

    if let Some(threshold) = positive("INGRESS_CB_FAILURE_THRESHOLD") {
        config.circuit_breaker.failure_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
    }
    if let Some(ms) = positive("INGRESS_CB_COOLDOWN_MS") {
        config.circuit_breaker.cooldown_ms = ms as u64;
    }

    if let Some(n) = positive("INGRESS_MAX_INFLIGHT") {
        config.admission.max_inflight = n as usize;
    }
    if let Some(n) = positive("INGRESS_MAX_QUEUE") {
        config.admission.max_queue = n as usize;
    }
    if let Some(ms) = positive("INGRESS_QUEUE_TIMEOUT_MS") {
        config.admission.queue_timeout_ms = ms as u64;
    }

    if let Some(keep_alive) = flag("INGRESS_KEEP_ALIVE") {
        config.pool.keep_alive = keep_alive;
    }
    if let Some(ms) = positive("INGRESS_KEEP_ALIVE_MSECS") {
        config.pool.keep_alive_ms = ms as u64;
    }
    if let Some(n) = positive("INGRESS_MAX_SOCKETS") {
        config.pool.max_sockets = n as usize;
    }
    if let Some(n) = positive("INGRESS_MAX_FREE_SOCKETS") {
        config.pool.max_free_sockets = n as usize;
    }
}

/// `INGRESS_NODES`, then `SERVER_CLUSTER_NODES`, then `CLUSTER_NODES`
/// shifted from storage ports to application ports.
fn resolve_env_nodes<F>(var: &F) -> Vec<crate::config::NodeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var("INGRESS_NODES") {
        let nodes = parse_nodes(&raw);
        if !nodes.is_empty() {
            return nodes;
        }
    }
    if let Some(raw) = var("SERVER_CLUSTER_NODES") {
        let nodes = parse_nodes(&raw);
        if !nodes.is_empty() {
            return nodes;
        }
    }
    match var("CLUSTER_NODES") {
        Some(raw) => {
            let kvs_port = var("KVS_PORT").and_then(|v| parse_int(&v)).unwrap_or(4000);
            let server_port = var("SERVER_PORT").and_then(|v| parse_int(&v)).unwrap_or(3000);
            derive_from_cluster(&raw, kvs_port, server_port)
        }
        None => Vec::new(),
    }
}

/// Lenient integer parse: optional sign followed by leading digits, the
/// rest ignored (`"60ms"` is 60).
pub fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
