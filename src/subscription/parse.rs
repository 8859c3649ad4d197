//! Subscription body parser
//!
//! Recognizes three dialects, in order, stopping at the first non-empty
//! result:
//! 1. plain newline-separated proxy URI list
//! 2. the same list wrapped in base64 (standard or URL-safe, padding
//!    optional)
//! 3. YAML with a top-level `proxies:` sequence - entries become named-only
//!    nodes with no URI (Connect rejects them until a refresh yields links)

use crate::store::ServerNode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;

/// Parse a subscription body into server nodes. Duplicate names are
/// suppressed case-insensitively; order of first appearance is kept.
pub fn parse_content(body: &str) -> Vec<ServerNode> {
    let content = body.trim();
    if content.is_empty() {
        return Vec::new();
    }

    let uris = extract_uri_list(content);
    if !uris.is_empty() {
        return uris_to_nodes(&uris);
    }

    if let Some(decoded) = decode_base64_compat(content) {
        if let Ok(text) = String::from_utf8(decoded) {
            let uris = extract_uri_list(&text);
            if !uris.is_empty() {
                return uris_to_nodes(&uris);
            }
        }
    }

    yaml_proxies_to_nodes(content)
}

/// Decode base64 tolerating URL-safe alphabets and missing padding.
pub(crate) fn decode_base64_compat(input: &str) -> Option<Vec<u8>> {
    let mut normalized: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    let rem = normalized.len() % 4;
    if rem != 0 {
        normalized.extend(std::iter::repeat('=').take(4 - rem));
    }
    STANDARD.decode(normalized.as_bytes()).ok()
}

fn extract_uri_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains("://"))
        .map(str::to_string)
        .collect()
}

fn uris_to_nodes(uris: &[String]) -> Vec<ServerNode> {
    let mut seen = std::collections::HashSet::new();
    let mut nodes = Vec::with_capacity(uris.len());
    for (index, raw) in uris.iter().enumerate() {
        let mut name = extract_name(raw);
        if name.is_empty() {
            name = format!("server-{}", index + 1);
        }
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        let address = extract_host(raw);
        let id = if address.is_empty() {
            name.clone()
        } else {
            format!("{name}-{address}")
        };
        nodes.push(ServerNode {
            id,
            name,
            address,
            country: String::new(),
            ping: 0,
            uri: raw.clone(),
        });
    }
    nodes
}

fn yaml_proxies_to_nodes(content: &str) -> Vec<ServerNode> {
    let root: serde_yaml::Value = match serde_yaml::from_str(content) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let proxies = match root.get("proxies").and_then(|p| p.as_sequence()) {
        Some(seq) => seq,
        None => return Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut nodes = Vec::with_capacity(proxies.len());
    for entry in proxies {
        let name = match entry.get("name").and_then(|n| n.as_str()) {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => continue,
        };
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        let address = entry
            .get("server")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let id = if address.is_empty() {
            name.clone()
        } else {
            format!("{name}-{address}")
        };
        nodes.push(ServerNode {
            id,
            name,
            address,
            country: String::new(),
            ping: 0,
            uri: String::new(),
        });
    }
    nodes
}

/// Name of a URI line: URL-decoded `#fragment` when present, otherwise the
/// authority (host, with port if any).
fn extract_name(raw: &str) -> String {
    if let Some((_, fragment)) = raw.split_once('#') {
        if !fragment.is_empty() {
            return percent_decode_str(fragment)
                .decode_utf8()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| fragment.trim().to_string());
        }
    }
    authority(raw).to_string()
}

/// Host of a URI line, stripped of port.
fn extract_host(raw: &str) -> String {
    let hostport = authority(raw);
    split_host_port(hostport).0.to_string()
}

/// The `host:port` part of a URI: after the scheme and any userinfo, before
/// path, query and fragment.
fn authority(raw: &str) -> &str {
    let rest = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    let rest = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    match rest.rsplit_once('@') {
        Some((_, hostport)) => hostport,
        None => rest,
    }
}

/// Split `host:port`, tolerating a missing port and bracketed IPv6 hosts.
pub(crate) fn split_host_port(hostport: &str) -> (&str, Option<&str>) {
    if let Some(stripped) = hostport.strip_prefix('[') {
        if let Some((host, rest)) = stripped.split_once(']') {
            let port = rest.strip_prefix(':');
            return (host, port);
        }
    }
    match hostport.rsplit_once(':') {
        // A second ':' means an unbracketed IPv6 literal, not a port.
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (hostport, None),
    }
}
