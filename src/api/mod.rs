//! Control HTTP/JSON API
//!
//! Localhost server consumed by the UI and the orchestrator. Runs on a
//! dedicated thread with a stop flag, driving the async engine facade
//! through a runtime handle. All responses are JSON with permissive CORS;
//! `OPTIONS` preflights answer 204.

use crate::store::{ServerNode, Settings};
use crate::vpn::engine::VpnEngine;
use crate::vpn::VpnError;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

/// Default control API address, overridable via `NEKKUS_HTTP_ADDR`.
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9001";

pub struct ApiServer {
    stop_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    addr: SocketAddr,
}

impl ApiServer {
    /// Bind `addr` and start serving. The runtime handle is used to drive
    /// the engine's async operations from the server thread.
    pub fn start(
        addr: &str,
        engine: Arc<VpnEngine>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, String> {
        let server =
            Server::http(addr).map_err(|e| format!("failed to bind control API {addr}: {e}"))?;
        let local_addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| "control API has no IP address".to_string())?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop_flag);
        let thread_handle = thread::spawn(move || {
            run_server(server, engine, runtime, stop_clone);
        });

        info!("control API listening on http://{local_addr}");
        Ok(Self {
            stop_flag,
            thread_handle: Some(thread_handle),
            addr: local_addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_server(
    server: Server,
    engine: Arc<VpnEngine>,
    runtime: tokio::runtime::Handle,
    stop_flag: Arc<AtomicBool>,
) {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        match server.recv_timeout(Duration::from_millis(100)) {
            Ok(Some(request)) => handle_request(request, &engine, &runtime),
            Ok(None) => continue,
            Err(e) => {
                error!("control API receive error: {e}");
                break;
            }
        }
    }
}

fn handle_request(mut request: Request, engine: &Arc<VpnEngine>, runtime: &tokio::runtime::Handle) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (url, String::new()),
    };

    if method == Method::Options {
        respond(request, Response::empty(StatusCode(204)));
        return;
    }

    let mut body = String::new();
    if method == Method::Post {
        if let Err(e) = request.as_reader().read_to_string(&mut body) {
            warn!("control API body read failed: {e}");
            respond_json(request, 400, &json!({"error": "unreadable body"}));
            return;
        }
    }

    let (status, payload) = route(&method, &path, &query, &body, engine, runtime);
    respond_json(request, status, &payload);
}

fn route(
    method: &Method,
    path: &str,
    query: &str,
    body: &str,
    engine: &Arc<VpnEngine>,
    runtime: &tokio::runtime::Handle,
) -> (u16, Value) {
    match (method, path) {
        (Method::Get, "/api/status") => (200, engine.status_snapshot()),

        (Method::Get, "/api/servers") => {
            let config_id = query_param(query, "config_id").unwrap_or_default();
            let servers: Vec<ServerNode> = engine.servers_by_config(&config_id);
            (200, json!(servers))
        }

        (Method::Post, "/api/connect") => {
            #[derive(Default, Deserialize)]
            struct ConnectBody {
                #[serde(default)]
                server_id: String,
                #[serde(default)]
                server: String,
            }
            let parsed: ConnectBody = serde_json::from_str(body).unwrap_or_default();
            let server_id = if parsed.server_id.is_empty() {
                parsed.server
            } else {
                parsed.server_id
            };
            if server_id.is_empty() {
                return (400, json!({"error": "server_id or server required"}));
            }
            match runtime.block_on(engine.connect(&server_id)) {
                Ok(()) => (200, engine.status_snapshot()),
                Err(e) => (error_status(&e), json!({"error": e.to_string()})),
            }
        }

        (Method::Post, "/api/disconnect") => match runtime.block_on(engine.disconnect()) {
            Ok(()) => (200, engine.status_snapshot()),
            Err(e) => (error_status(&e), json!({"error": e.to_string()})),
        },

        (Method::Get, "/api/subscriptions") => (200, json!(engine.subscriptions())),

        (Method::Post, "/api/subscriptions") => {
            #[derive(Default, Deserialize)]
            struct SubscriptionBody {
                #[serde(default)]
                name: String,
                #[serde(default)]
                url: String,
            }
            let parsed: SubscriptionBody = match serde_json::from_str(body) {
                Ok(parsed) => parsed,
                Err(_) => return (400, json!({"error": "invalid request"})),
            };
            if parsed.url.is_empty() {
                return (400, json!({"error": "url required"}));
            }
            match engine.add_subscription(&parsed.name, &parsed.url) {
                Ok(sub) => (200, json!(sub)),
                Err(e) => (error_status(&e), json!({"error": e.to_string()})),
            }
        }

        (Method::Post, "/api/subscriptions/refresh") => {
            let results = runtime.block_on(engine.refresh_all());
            (200, json!(results))
        }

        (Method::Get, "/api/configs") => {
            let configs: Vec<Value> = engine
                .subscriptions()
                .iter()
                .map(|sub| {
                    json!({
                        "id": sub.id,
                        "name": sub.name,
                        "content": "",
                        "source_url": sub.url,
                        "subscription_id": sub.id,
                        "created_at": sub.updated_at,
                        "updated_at": sub.updated_at,
                    })
                })
                .collect();
            (200, json!(configs))
        }

        (Method::Get, "/api/settings") => (200, json!(engine.get_settings())),

        (Method::Post, "/api/settings") => {
            let patch: Settings = match serde_json::from_str(body) {
                Ok(patch) => patch,
                Err(_) => return (400, json!({"error": "invalid request"})),
            };
            match engine.update_settings(patch) {
                Ok(settings) => (200, json!(settings)),
                Err(e) => (error_status(&e), json!({"error": e.to_string()})),
            }
        }

        (Method::Get, "/api/traffic") => (200, json!(engine.traffic_stats())),

        (Method::Get, "/api/deps/singbox") => (200, json!(engine.singbox_status())),

        (Method::Post, "/api/deps/singbox/install") => {
            match runtime.block_on(engine.install_singbox()) {
                Ok(status) => (200, json!(status)),
                Err(e) => (error_status(&e), json!({"error": e.to_string()})),
            }
        }

        (Method::Get, "/api/logs") => (200, json!(engine.logs_snapshot())),

        _ => (404, json!({"error": "not found"})),
    }
}

/// HTTP status for a facade error: bad input is the caller's fault,
/// missing entities are 404, everything else is a server-side failure.
fn error_status(err: &VpnError) -> u16 {
    use crate::store::StoreError;
    match err {
        VpnError::InvalidInput(_) => 400,
        VpnError::Store(StoreError::SubscriptionNotFound(_))
        | VpnError::Store(StoreError::ServerNotFound(_)) => 404,
        _ => 500,
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn respond_json(request: Request, status: u16, payload: &Value) {
    let body = payload.to_string();
    let response = Response::from_string(body)
        .with_status_code(StatusCode(status))
        .with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                .expect("static header"),
        );
    respond(request, response);
}

fn respond<R: Read>(request: Request, response: Response<R>) {
    let response = with_cors(response);
    if let Err(e) = request.respond(response) {
        warn!("control API response failed: {e}");
    }
}

fn with_cors<R: Read>(response: Response<R>) -> Response<R> {
    response
        .with_header(
            Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"*"[..])
                .expect("static header"),
        )
        .with_header(
            Header::from_bytes(
                &b"Access-Control-Allow-Methods"[..],
                &b"GET, POST, OPTIONS"[..],
            )
            .expect("static header"),
        )
        .with_header(
            Header::from_bytes(
                &b"Access-Control-Allow-Headers"[..],
                &b"Content-Type"[..],
            )
            .expect("static header"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param("config_id=sub-1&x=2", "config_id").as_deref(),
            Some("sub-1")
        );
        assert_eq!(query_param("x=2", "config_id"), None);
        assert_eq!(
            query_param("config_id=a%20b", "config_id").as_deref(),
            Some("a b")
        );
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&VpnError::InvalidInput("x".to_string())),
            400
        );
        assert_eq!(
            error_status(&VpnError::Store(
                crate::store::StoreError::ServerNotFound("x".to_string())
            )),
            404
        );
        assert_eq!(error_status(&VpnError::ServerHasNoUri), 500);
        assert_eq!(error_status(&VpnError::NoServersAvailable), 500);
    }
}
