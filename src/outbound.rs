//! Outbound builder - proxy URI to sing-box outbound translation
//!
//! Parses the informal `vless://`, `vmess://`, `trojan://` and `ss://` link
//! dialects into a typed model and renders the outbound JSON consumed by
//! the engine config. The rendered object carries no `tag`; the engine
//! inserts `tag: "proxy"` when assembling the full config.

use crate::subscription::parse::{decode_base64_compat, split_host_port};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use url::Url;

/// Outbound translation errors
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),
}

/// TLS options shared by the TLS-capable schemes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub server_name: Option<String>,
    pub alpn: Option<Vec<String>>,
    /// REALITY handshake: (public key, short id).
    pub reality: Option<(String, String)>,
    /// uTLS ClientHello fingerprint, required by REALITY clients.
    pub fingerprint: Option<String>,
}

/// V2Ray-style stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Ws {
        path: Option<String>,
        host: Option<String>,
    },
    Grpc {
        service_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessUri {
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub flow: Option<String>,
    pub tls: Option<TlsOptions>,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmessUri {
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub alter_id: u32,
    pub tls: Option<TlsOptions>,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanUri {
    pub server: String,
    pub port: u16,
    pub password: String,
    pub tls: TlsOptions,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksUri {
    pub server: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

/// A parsed proxy link, one variant per supported scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyUri {
    Vless(VlessUri),
    Vmess(VmessUri),
    Trojan(TrojanUri),
    Shadowsocks(ShadowsocksUri),
}

/// Parse a proxy URI and render its sing-box outbound in one step.
pub fn build_outbound(raw: &str) -> Result<Value, OutboundError> {
    Ok(ProxyUri::parse(raw)?.to_outbound())
}

impl ProxyUri {
    pub fn parse(raw: &str) -> Result<Self, OutboundError> {
        let raw = raw.trim();
        let scheme = raw
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .ok_or_else(|| OutboundError::UnsupportedScheme(raw.to_string()))?;
        match scheme.as_str() {
            "vless" => parse_vless(raw).map(ProxyUri::Vless),
            "vmess" => parse_vmess(raw).map(ProxyUri::Vmess),
            "trojan" => parse_trojan(raw).map(ProxyUri::Trojan),
            "ss" => parse_shadowsocks(raw).map(ProxyUri::Shadowsocks),
            other => Err(OutboundError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Render the outbound block (without a `tag`).
    pub fn to_outbound(&self) -> Value {
        match self {
            ProxyUri::Vless(v) => {
                let mut out = base_outbound("vless", &v.server, v.port);
                out.insert("uuid".into(), json!(v.uuid));
                if let Some(flow) = &v.flow {
                    out.insert("flow".into(), json!(flow));
                }
                if let Some(tls) = &v.tls {
                    out.insert("tls".into(), tls_value(tls));
                }
                if let Some(transport) = &v.transport {
                    out.insert("transport".into(), transport_value(transport));
                }
                Value::Object(out)
            }
            ProxyUri::Vmess(v) => {
                let mut out = base_outbound("vmess", &v.server, v.port);
                out.insert("uuid".into(), json!(v.uuid));
                out.insert("security".into(), json!("auto"));
                out.insert("alter_id".into(), json!(v.alter_id));
                if let Some(tls) = &v.tls {
                    out.insert("tls".into(), tls_value(tls));
                }
                if let Some(transport) = &v.transport {
                    out.insert("transport".into(), transport_value(transport));
                }
                Value::Object(out)
            }
            ProxyUri::Trojan(t) => {
                let mut out = base_outbound("trojan", &t.server, t.port);
                out.insert("password".into(), json!(t.password));
                out.insert("tls".into(), tls_value(&t.tls));
                if let Some(transport) = &t.transport {
                    out.insert("transport".into(), transport_value(transport));
                }
                Value::Object(out)
            }
            ProxyUri::Shadowsocks(s) => {
                let mut out = base_outbound("shadowsocks", &s.server, s.port);
                out.insert("method".into(), json!(s.method));
                out.insert("password".into(), json!(s.password));
                Value::Object(out)
            }
        }
    }
}

fn base_outbound(kind: &str, server: &str, port: u16) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("type".into(), json!(kind));
    out.insert("server".into(), json!(server));
    out.insert("server_port".into(), json!(port));
    out
}

fn tls_value(tls: &TlsOptions) -> Value {
    let mut obj = Map::new();
    obj.insert("enabled".into(), json!(true));
    if let Some(server_name) = &tls.server_name {
        obj.insert("server_name".into(), json!(server_name));
    }
    if let Some(alpn) = &tls.alpn {
        obj.insert("alpn".into(), json!(alpn));
    }
    if let Some((public_key, short_id)) = &tls.reality {
        obj.insert(
            "reality".into(),
            json!({"public_key": public_key, "short_id": short_id}),
        );
    }
    if let Some(fingerprint) = &tls.fingerprint {
        obj.insert("utls".into(), json!({"fingerprint": fingerprint}));
    }
    Value::Object(obj)
}

fn transport_value(transport: &Transport) -> Value {
    match transport {
        Transport::Ws { path, host } => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("ws"));
            if let Some(path) = path {
                obj.insert("path".into(), json!(path));
            }
            if let Some(host) = host {
                obj.insert("headers".into(), json!({"Host": host}));
            }
            Value::Object(obj)
        }
        Transport::Grpc { service_name } => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("grpc"));
            if let Some(service_name) = service_name {
                obj.insert("service_name".into(), json!(service_name));
            }
            Value::Object(obj)
        }
    }
}

fn parse_url(raw: &str) -> Result<(Url, HashMap<String, String>), OutboundError> {
    let url = Url::parse(raw).map_err(|e| OutboundError::InvalidUri(e.to_string()))?;
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    Ok((url, query))
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Transport selection shared by vless, vmess and trojan. Empty and "tcp"
/// mean no transport block.
fn parse_transport(
    kind: &str,
    path: Option<&String>,
    host: Option<&String>,
    service_name: Option<&String>,
) -> Result<Option<Transport>, OutboundError> {
    match kind {
        "" | "tcp" => Ok(None),
        "ws" | "websocket" => Ok(Some(Transport::Ws {
            path: path.cloned().filter(|p| !p.is_empty()),
            host: host.cloned().filter(|h| !h.is_empty()),
        })),
        "grpc" => Ok(Some(Transport::Grpc {
            service_name: service_name.cloned().filter(|s| !s.is_empty()),
        })),
        other => Err(OutboundError::UnsupportedTransport(other.to_string())),
    }
}

fn alpn_list(query: &HashMap<String, String>) -> Option<Vec<String>> {
    query
        .get("alpn")
        .filter(|a| !a.is_empty())
        .map(|a| a.split(',').map(str::to_string).collect())
}

fn parse_vless(raw: &str) -> Result<VlessUri, OutboundError> {
    let (url, query) = parse_url(raw)?;
    let server = url.host_str().unwrap_or_default().to_string();
    let port = url.port().unwrap_or(443);

    let uuid = decode_component(url.username());
    if uuid.is_empty() {
        return Err(OutboundError::MissingCredential("vless uuid"));
    }

    let security = query
        .get("security")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let server_name = query
        .get("sni")
        .or_else(|| query.get("host"))
        .cloned()
        .filter(|s| !s.is_empty())
        .or_else(|| (!server.is_empty()).then(|| server.clone()));

    let tls = match security.as_str() {
        "tls" => Some(TlsOptions {
            server_name,
            alpn: alpn_list(&query),
            reality: None,
            fingerprint: None,
        }),
        "reality" => {
            let public_key = query
                .get("pbk")
                .filter(|v| !v.is_empty())
                .ok_or(OutboundError::MissingCredential("reality public key (pbk)"))?;
            let short_id = query
                .get("sid")
                .filter(|v| !v.is_empty())
                .ok_or(OutboundError::MissingCredential("reality short id (sid)"))?;
            let fingerprint = query
                .get("fp")
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| "chrome".to_string());
            Some(TlsOptions {
                server_name,
                alpn: alpn_list(&query),
                reality: Some((public_key.clone(), short_id.clone())),
                fingerprint: Some(fingerprint),
            })
        }
        _ => None,
    };

    let transport_kind = query
        .get("type")
        .map(|t| t.to_ascii_lowercase())
        .unwrap_or_default();
    let transport = parse_transport(
        &transport_kind,
        query.get("path"),
        query.get("host"),
        query.get("serviceName"),
    )?;

    Ok(VlessUri {
        server,
        port,
        uuid,
        flow: query.get("flow").cloned().filter(|f| !f.is_empty()),
        tls,
        transport,
    })
}

fn parse_trojan(raw: &str) -> Result<TrojanUri, OutboundError> {
    let (url, query) = parse_url(raw)?;
    let server = url.host_str().unwrap_or_default().to_string();
    let port = url.port().unwrap_or(443);

    let password = decode_component(url.username());
    if password.is_empty() {
        return Err(OutboundError::MissingCredential("trojan password"));
    }

    // Trojan is always TLS; server_name falls back to the URI host.
    let server_name = query
        .get("sni")
        .cloned()
        .filter(|s| !s.is_empty())
        .or_else(|| (!server.is_empty()).then(|| server.clone()));
    let tls = TlsOptions {
        server_name,
        alpn: alpn_list(&query),
        reality: None,
        fingerprint: None,
    };

    let transport_kind = query
        .get("type")
        .map(|t| t.to_ascii_lowercase())
        .unwrap_or_default();
    let transport = parse_transport(
        &transport_kind,
        query.get("path"),
        query.get("host"),
        query.get("serviceName"),
    )?;

    Ok(TrojanUri {
        server,
        port,
        password,
        tls,
        transport,
    })
}

/// Raw vmess link payload: base64 of a JSON object. Numeric fields appear
/// both as strings and as numbers in the wild.
#[derive(Debug, Default, Deserialize)]
struct VmessLink {
    #[serde(default)]
    add: String,
    #[serde(default, deserialize_with = "de_stringly")]
    port: String,
    #[serde(default)]
    id: String,
    #[serde(default, deserialize_with = "de_stringly")]
    aid: String,
    #[serde(default)]
    net: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    sni: String,
}

fn de_stringly<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn after_scheme(raw: &str) -> &str {
    match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => raw,
    }
}

fn parse_vmess(raw: &str) -> Result<VmessUri, OutboundError> {
    let payload = after_scheme(raw.trim());
    let decoded = decode_base64_compat(payload)
        .ok_or_else(|| OutboundError::InvalidUri("vmess payload is not base64".to_string()))?;
    let link: VmessLink = serde_json::from_slice(&decoded)
        .map_err(|e| OutboundError::InvalidUri(format!("vmess payload: {e}")))?;

    if link.add.is_empty() || link.id.is_empty() {
        return Err(OutboundError::MissingCredential("vmess add/id"));
    }
    let port: u16 = link
        .port
        .parse()
        .map_err(|_| OutboundError::InvalidPort(link.port.clone()))?;
    let alter_id: u32 = link.aid.parse().unwrap_or(0);

    let tls = if link.tls.eq_ignore_ascii_case("tls") {
        let server_name = [&link.sni, &link.host, &link.add]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned();
        Some(TlsOptions {
            server_name,
            alpn: None,
            reality: None,
            fingerprint: None,
        })
    } else {
        None
    };

    let transport = parse_transport(
        &link.net.to_ascii_lowercase(),
        Some(&link.path),
        Some(&link.host),
        None,
    )?;

    Ok(VmessUri {
        server: link.add,
        port,
        uuid: link.id,
        alter_id,
        tls,
        transport,
    })
}

fn parse_shadowsocks(raw: &str) -> Result<ShadowsocksUri, OutboundError> {
    let rest = after_scheme(raw.trim());
    let rest = rest.split_once('#').map(|(body, _)| body).unwrap_or(rest);
    let (userinfo, hostport) = rest
        .rsplit_once('@')
        .ok_or(OutboundError::MissingCredential("shadowsocks credentials"))?;

    let (host, port_str) = split_host_port(hostport);
    let port = match port_str {
        Some(p) => p
            .parse()
            .map_err(|_| OutboundError::InvalidPort(p.to_string()))?,
        None => 8388,
    };

    let userinfo = decode_component(userinfo);
    let credentials = if userinfo.contains(':') {
        userinfo
    } else {
        decode_base64_compat(&userinfo)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(OutboundError::MissingCredential("shadowsocks credentials"))?
    };
    let (method, password) = credentials
        .split_once(':')
        .ok_or(OutboundError::MissingCredential("shadowsocks credentials"))?;
    if method.is_empty() || password.is_empty() {
        return Err(OutboundError::MissingCredential("shadowsocks credentials"));
    }

    Ok(ShadowsocksUri {
        server: host.to_string(),
        port,
        method: method.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_vless_reality_ws_shape() {
        let out = build_outbound(
            "vless://UUID@h:443?security=reality&pbk=KEY&sid=SID&fp=firefox&sni=x.com&type=ws&path=/p&host=w.com",
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "type": "vless",
                "server": "h",
                "server_port": 443,
                "uuid": "UUID",
                "tls": {
                    "enabled": true,
                    "server_name": "x.com",
                    "reality": {"public_key": "KEY", "short_id": "SID"},
                    "utls": {"fingerprint": "firefox"}
                },
                "transport": {"type": "ws", "path": "/p", "headers": {"Host": "w.com"}}
            })
        );
    }

    #[test]
    fn test_vless_defaults() {
        let out = build_outbound("vless://UUID@h").unwrap();
        assert_eq!(out["server_port"], 443);
        assert!(out.get("tls").is_none());
        assert!(out.get("transport").is_none());
    }

    #[test]
    fn test_vless_tls_sni_falls_back_to_host() {
        let out = build_outbound("vless://UUID@proxy.example:8443?security=tls").unwrap();
        assert_eq!(out["tls"]["server_name"], "proxy.example");
        assert_eq!(out["tls"]["enabled"], true);
    }

    #[test]
    fn test_vless_reality_fingerprint_defaults_to_chrome() {
        let out = build_outbound("vless://UUID@h:443?security=reality&pbk=K&sid=S").unwrap();
        assert_eq!(out["tls"]["utls"]["fingerprint"], "chrome");
    }

    #[test]
    fn test_vless_reality_requires_pbk_and_sid() {
        assert!(matches!(
            build_outbound("vless://UUID@h:443?security=reality&sid=S"),
            Err(OutboundError::MissingCredential(_))
        ));
        assert!(matches!(
            build_outbound("vless://UUID@h:443?security=reality&pbk=K"),
            Err(OutboundError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_vless_missing_uuid() {
        assert!(matches!(
            build_outbound("vless://h:443"),
            Err(OutboundError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_vless_flow_and_alpn() {
        let out = build_outbound(
            "vless://UUID@h:443?security=tls&flow=xtls-rprx-vision&alpn=h2,http/1.1",
        )
        .unwrap();
        assert_eq!(out["flow"], "xtls-rprx-vision");
        assert_eq!(out["tls"]["alpn"], json!(["h2", "http/1.1"]));
    }

    #[test]
    fn test_vless_grpc_transport() {
        let out =
            build_outbound("vless://UUID@h:443?type=grpc&serviceName=svc").unwrap();
        assert_eq!(out["transport"], json!({"type": "grpc", "service_name": "svc"}));
    }

    #[test]
    fn test_vless_unknown_transport() {
        assert!(matches!(
            build_outbound("vless://UUID@h:443?type=quic"),
            Err(OutboundError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn test_vmess_basic() {
        let payload = json!({
            "add": "9.9.9.9", "port": "8443", "id": "uuid-1", "aid": "2",
            "net": "ws", "host": "cdn.example", "path": "/v", "tls": "tls", "sni": ""
        });
        let raw = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        let out = build_outbound(&raw).unwrap();
        assert_eq!(out["type"], "vmess");
        assert_eq!(out["server"], "9.9.9.9");
        assert_eq!(out["server_port"], 8443);
        assert_eq!(out["uuid"], "uuid-1");
        assert_eq!(out["security"], "auto");
        assert_eq!(out["alter_id"], 2);
        // sni empty -> host wins as server_name
        assert_eq!(out["tls"]["server_name"], "cdn.example");
        assert_eq!(
            out["transport"],
            json!({"type": "ws", "path": "/v", "headers": {"Host": "cdn.example"}})
        );
    }

    #[test]
    fn test_vmess_numeric_port_and_aid() {
        let payload = json!({"add": "a.example", "port": 443, "id": "u", "aid": 0});
        let raw = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        let out = build_outbound(&raw).unwrap();
        assert_eq!(out["server_port"], 443);
        assert_eq!(out["alter_id"], 0);
        assert!(out.get("tls").is_none());
    }

    #[test]
    fn test_vmess_missing_fields() {
        let payload = json!({"add": "", "port": "443", "id": "u"});
        let raw = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        assert!(matches!(
            build_outbound(&raw),
            Err(OutboundError::MissingCredential(_))
        ));

        let payload = json!({"add": "h", "port": "nope", "id": "u"});
        let raw = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        assert!(matches!(
            build_outbound(&raw),
            Err(OutboundError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_vmess_not_base64() {
        assert!(matches!(
            build_outbound("vmess://%%%"),
            Err(OutboundError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_trojan_defaults() {
        let out = build_outbound("trojan://secret@t.example").unwrap();
        assert_eq!(out["type"], "trojan");
        assert_eq!(out["server_port"], 443);
        assert_eq!(out["password"], "secret");
        assert_eq!(out["tls"], json!({"enabled": true, "server_name": "t.example"}));
    }

    #[test]
    fn test_trojan_sni_and_alpn() {
        let out =
            build_outbound("trojan://secret@t.example:8443?sni=x.com&alpn=h2").unwrap();
        assert_eq!(out["tls"]["server_name"], "x.com");
        assert_eq!(out["tls"]["alpn"], json!(["h2"]));
    }

    #[test]
    fn test_trojan_missing_password() {
        assert!(matches!(
            build_outbound("trojan://t.example:443"),
            Err(OutboundError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_shadowsocks_plain() {
        let out = build_outbound("ss://aes-128-gcm:passw@5.6.7.8:8388#Osaka").unwrap();
        assert_eq!(
            out,
            json!({
                "type": "shadowsocks",
                "server": "5.6.7.8",
                "server_port": 8388,
                "method": "aes-128-gcm",
                "password": "passw"
            })
        );
    }

    #[test]
    fn test_shadowsocks_base64_userinfo() {
        // base64("aes-128-gcm:passw")
        let out = build_outbound("ss://YWVzLTEyOC1nY206cGFzc3c=@5.6.7.8:8388#Osaka").unwrap();
        assert_eq!(out["method"], "aes-128-gcm");
        assert_eq!(out["password"], "passw");
        assert_eq!(out["server"], "5.6.7.8");
    }

    #[test]
    fn test_shadowsocks_default_port() {
        let out = build_outbound("ss://YWVzLTEyOC1nY206cGFzc3c@5.6.7.8").unwrap();
        assert_eq!(out["server_port"], 8388);
    }

    #[test]
    fn test_shadowsocks_bad_credentials() {
        assert!(matches!(
            build_outbound("ss://5.6.7.8:8388"),
            Err(OutboundError::MissingCredential(_))
        ));
        // base64 decodes but has no colon
        assert!(matches!(
            build_outbound("ss://YWJj@5.6.7.8:8388"),
            Err(OutboundError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            build_outbound("socks5://u:p@h:1080"),
            Err(OutboundError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            build_outbound("plain text"),
            Err(OutboundError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let out = build_outbound("VLESS://UUID@h:443").unwrap();
        assert_eq!(out["type"], "vless");
    }
}
