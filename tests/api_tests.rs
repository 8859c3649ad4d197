//! Control API Tests
//!
//! End-to-end tests for the HTTP/JSON control surface, over a real socket.
//! Run with: cargo test --test api_tests

use nekkus_net::api::ApiServer;
use nekkus_net::store::{ServerNode, Store};
use nekkus_net::VpnEngine;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct TestApi {
    // Field order matters: the server (and its handler thread) must shut
    // down before the runtime it borrows a handle from.
    server: ApiServer,
    engine: Arc<VpnEngine>,
    _runtime: tokio::runtime::Runtime,
}

fn start_api() -> TestApi {
    let dir = std::env::temp_dir().join(format!(
        "nekkus-api-test-{}-{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    let store = Arc::new(Store::open(dir).unwrap());
    let engine = Arc::new(VpnEngine::new(store));
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = ApiServer::start(
        "127.0.0.1:0",
        Arc::clone(&engine),
        runtime.handle().clone(),
    )
    .unwrap();
    TestApi {
        server,
        engine,
        _runtime: runtime,
    }
}

/// Minimal HTTP/1.1 round over a plain socket. Returns status code,
/// headers and body.
fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> (u16, Vec<String>, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers: Vec<String> = lines.map(|l| l.to_string()).collect();
    (status, headers, body.to_string())
}

fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
    let (status, _, body) = request(addr, "GET", path, None);
    let value = serde_json::from_str(&body).unwrap_or(Value::Null);
    (status, value)
}

fn post(addr: SocketAddr, path: &str, body: &str) -> (u16, Value) {
    let (status, _, body) = request(addr, "POST", path, Some(body));
    let value = serde_json::from_str(&body).unwrap_or(Value::Null);
    (status, value)
}

#[test]
fn test_status_starts_disconnected() {
    let api = start_api();
    let (status, value) = get(api.server.addr(), "/api/status");
    assert_eq!(status, 200);
    assert_eq!(value["connected"], false);
    assert_eq!(value["server"], "");
    assert_eq!(value["configCount"], 0);
    assert!(value["lastUpdateUnix"].as_i64().unwrap() > 0);
}

#[test]
fn test_options_preflight() {
    let api = start_api();
    let (status, headers, _) = request(api.server.addr(), "OPTIONS", "/api/connect", None);
    assert_eq!(status, 204);
    assert!(headers
        .iter()
        .any(|h| h.to_lowercase().starts_with("access-control-allow-origin: *")));
}

#[test]
fn test_subscription_lifecycle() {
    let api = start_api();
    let addr = api.server.addr();

    let (status, subs) = get(addr, "/api/subscriptions");
    assert_eq!(status, 200);
    assert_eq!(subs, serde_json::json!([]));

    let (status, sub) = post(
        addr,
        "/api/subscriptions",
        r#"{"name": "S", "url": "https://example.com/sub"}"#,
    );
    assert_eq!(status, 200);
    assert_eq!(sub["name"], "S");
    assert_eq!(sub["url"], "https://example.com/sub");
    assert!(sub["id"].as_str().unwrap().starts_with("sub-"));

    let (status, subs) = get(addr, "/api/subscriptions");
    assert_eq!(status, 200);
    assert_eq!(subs.as_array().unwrap().len(), 1);

    // Projection used by the UI.
    let (status, configs) = get(addr, "/api/configs");
    assert_eq!(status, 200);
    assert_eq!(configs[0]["source_url"], "https://example.com/sub");
    assert_eq!(configs[0]["id"], sub["id"]);
}

#[test]
fn test_subscription_requires_url() {
    let api = start_api();
    let (status, value) = post(api.server.addr(), "/api/subscriptions", r#"{"name": "S"}"#);
    assert_eq!(status, 400);
    assert!(value["error"].as_str().unwrap().contains("url"));
}

#[test]
fn test_servers_listing_and_filter() {
    let api = start_api();
    let addr = api.server.addr();

    let sub = api
        .engine
        .add_subscription("S", "https://example.com/sub")
        .unwrap();
    api.engine
        .store()
        .update_subscription_servers(
            &sub.id,
            vec![
                ServerNode {
                    id: "Tokyo-1.2.3.4".to_string(),
                    name: "Tokyo".to_string(),
                    address: "1.2.3.4".to_string(),
                    country: String::new(),
                    ping: 0,
                    uri: "vless://abc-uuid@1.2.3.4:443?security=tls&sni=ex.com#Tokyo".to_string(),
                },
                ServerNode {
                    id: "Osaka-5.6.7.8".to_string(),
                    name: "Osaka".to_string(),
                    address: "5.6.7.8".to_string(),
                    country: String::new(),
                    ping: 0,
                    uri: "ss://YWVzLTEyOC1nY206cGFzc3c=@5.6.7.8:8388#Osaka".to_string(),
                },
            ],
        )
        .unwrap();

    let (status, servers) = get(addr, "/api/servers");
    assert_eq!(status, 200);
    let servers = servers.as_array().unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0]["name"], "Tokyo");
    assert_eq!(servers[0]["address"], "1.2.3.4");
    assert!(!servers[0]["uri"].as_str().unwrap().is_empty());
    assert_eq!(servers[1]["name"], "Osaka");
    assert_eq!(servers[1]["address"], "5.6.7.8");
    assert!(!servers[1]["uri"].as_str().unwrap().is_empty());

    let (status, servers) = get(addr, &format!("/api/servers?config_id={}", sub.id));
    assert_eq!(status, 200);
    assert_eq!(servers.as_array().unwrap().len(), 2);

    let (status, servers) = get(addr, "/api/servers?config_id=unknown");
    assert_eq!(status, 200);
    assert_eq!(servers.as_array().unwrap().len(), 2);
}

#[test]
fn test_connect_requires_server_id() {
    let api = start_api();
    let (status, value) = post(api.server.addr(), "/api/connect", "{}");
    assert_eq!(status, 400);
    assert!(value["error"].as_str().unwrap().contains("server"));
}

#[test]
fn test_connect_with_empty_uri_fails_cleanly() {
    let api = start_api();
    let addr = api.server.addr();

    // A YAML-only subscription entry: named, but no usable link.
    let sub = api
        .engine
        .add_subscription("S", "https://example.com/sub")
        .unwrap();
    api.engine
        .store()
        .update_subscription_servers(
            &sub.id,
            vec![ServerNode {
                id: "named-only".to_string(),
                name: "named-only".to_string(),
                address: String::new(),
                country: String::new(),
                ping: 0,
                uri: String::new(),
            }],
        )
        .unwrap();

    let (status, value) = post(addr, "/api/connect", r#"{"server_id": "named-only"}"#);
    assert_eq!(status, 500);
    assert!(value["error"].as_str().unwrap().contains("uri"));

    let (status, value) = get(addr, "/api/status");
    assert_eq!(status, 200);
    assert_eq!(value["connected"], false);
}

#[test]
fn test_disconnect_when_idle() {
    let api = start_api();
    let (status, value) = post(api.server.addr(), "/api/disconnect", "");
    assert_eq!(status, 200);
    assert_eq!(value["connected"], false);
}

#[test]
fn test_settings_roundtrip_and_merge() {
    let api = start_api();
    let addr = api.server.addr();

    let (status, value) = get(addr, "/api/settings");
    assert_eq!(status, 200);
    assert_eq!(value, serde_json::json!({}));

    let (status, value) = post(
        addr,
        "/api/settings",
        r#"{"sing_box_path": "/opt/sing-box", "default_server": "tokyo"}"#,
    );
    assert_eq!(status, 200);
    assert_eq!(value["sing_box_path"], "/opt/sing-box");

    // A partial patch must not clear other fields.
    let (status, value) = post(addr, "/api/settings", r#"{"default_config_id": "sub-1"}"#);
    assert_eq!(status, 200);
    assert_eq!(value["sing_box_path"], "/opt/sing-box");
    assert_eq!(value["default_server"], "tokyo");
    assert_eq!(value["default_config_id"], "sub-1");
}

#[test]
fn test_traffic_empty_when_disconnected() {
    let api = start_api();
    let (status, value) = get(api.server.addr(), "/api/traffic");
    assert_eq!(status, 200);
    assert_eq!(value["download"], 0);
    assert_eq!(value["upload"], 0);
    assert_eq!(value["download_speed"], 0);
}

#[test]
fn test_logs_start_empty() {
    let api = start_api();
    let (status, value) = get(api.server.addr(), "/api/logs");
    assert_eq!(status, 200);
    assert_eq!(value, serde_json::json!([]));
}

#[test]
fn test_deps_singbox_shape() {
    let api = start_api();
    let (status, value) = get(api.server.addr(), "/api/deps/singbox");
    assert_eq!(status, 200);
    assert!(value["installed"].is_boolean());
}

#[test]
fn test_unknown_route() {
    let api = start_api();
    let (status, _) = get(api.server.addr(), "/api/nope");
    assert_eq!(status, 404);
}
