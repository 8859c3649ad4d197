//! VPN engine facade - connection state machine and orchestration
//!
//! Owns all in-memory connection state and the child process. Connect is a
//! linear pipeline of fallible steps; each step that leaves an effect
//! behind pushes a rollback entry, and any later failure unwinds the
//! accumulated rollbacks in reverse. Disconnect preempts an in-flight
//! Connect by bumping the state epoch, which the pipeline and the
//! readiness gate observe at their next step boundary.

use super::config;
use super::logbuf::LogBuffer;
use super::readiness::{self, ChildWatch};
use super::supervisor::Supervisor;
use super::sysproxy;
use super::traffic::{TrafficSampler, TrafficStats};
use super::{VpnError, VpnResult};
use crate::installer::{self, SingBoxStatus};
use crate::outbound::build_outbound;
use crate::store::{ServerNode, Settings, Store, Subscription};
use crate::subscription;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long the readiness gate waits for the proxy port.
const READINESS_DEADLINE: Duration = Duration::from_secs(15);

/// Connection status, serialized lowercase for the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of refreshing one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub id: String,
    pub status: String,
}

struct EngineState {
    status: Status,
    current_node: Option<ServerNode>,
    last_config_path: Option<PathBuf>,
    last_error: Option<String>,
    /// Bumped by Disconnect to cancel an in-flight Connect.
    epoch: u64,
}

/// Effects to revert when a later connect step fails, unwound in reverse.
enum Rollback {
    RemoveFile(PathBuf),
    StopChild,
    ProxyOff,
}

pub struct VpnEngine {
    store: Arc<Store>,
    state: Mutex<EngineState>,
    /// Serializes the effectful sections of Connect/Disconnect.
    op_lock: tokio::sync::Mutex<()>,
    supervisor: Supervisor,
    logs: Arc<LogBuffer>,
    traffic: TrafficSampler,
}

impl VpnEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state: Mutex::new(EngineState {
                status: Status::Disconnected,
                current_node: None,
                last_config_path: None,
                last_error: None,
                epoch: 0,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            supervisor: Supervisor::new(),
            logs: Arc::new(LogBuffer::from_env()),
            traffic: TrafficSampler::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn current_server(&self) -> Option<ServerNode> {
        self.state.lock().current_node.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn logs_snapshot(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    pub fn traffic_stats(&self) -> TrafficStats {
        self.traffic.sample(self.status() == Status::Connected)
    }

    /// The `/api/status` object.
    pub fn status_snapshot(&self) -> Value {
        let (connected, server_name, server_id) = {
            let state = self.state.lock();
            (
                state.status == Status::Connected,
                state
                    .current_node
                    .as_ref()
                    .map(|n| n.name.clone())
                    .unwrap_or_default(),
                state
                    .current_node
                    .as_ref()
                    .map(|n| n.id.clone())
                    .unwrap_or_default(),
            )
        };
        let active_config_id = if connected {
            self.store.find_owner(&server_id).unwrap_or_default()
        } else {
            String::new()
        };
        let stats = self.traffic.sample(connected);
        json!({
            "connected": connected,
            "server": server_name,
            "activeConfigId": active_config_id,
            "configCount": self.store.list_subscriptions().len(),
            "downloadSpeed": stats.download_speed,
            "uploadSpeed": stats.upload_speed,
            "totalDownload": stats.download,
            "totalUpload": stats.upload,
            "lastUpdateUnix": unix_now(),
        })
    }

    // --- subscriptions -------------------------------------------------

    pub fn add_subscription(&self, name: &str, url: &str) -> VpnResult<Subscription> {
        let parsed = url::Url::parse(url)
            .map_err(|e| VpnError::InvalidInput(format!("malformed url: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(VpnError::InvalidInput(format!(
                "subscription url must be http(s), got {}",
                parsed.scheme()
            )));
        }
        let name = if name.is_empty() { url } else { name };
        Ok(self.store.add_subscription(name, url)?)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.store.list_subscriptions()
    }

    pub fn servers(&self) -> Vec<ServerNode> {
        self.store.list_servers()
    }

    /// Servers of one subscription, or all servers when the id is empty or
    /// unknown. Always a non-null list.
    pub fn servers_by_config(&self, config_id: &str) -> Vec<ServerNode> {
        if !config_id.is_empty() {
            if let Ok(sub) = self.store.get_subscription(config_id) {
                return sub.servers;
            }
        }
        self.store.list_servers()
    }

    pub async fn refresh_subscription(&self, id: &str) -> VpnResult<()> {
        let sub = self.store.get_subscription(id)?;
        match self.try_refresh(&sub).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.store.mark_refresh_failed(id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn try_refresh(&self, sub: &Subscription) -> VpnResult<()> {
        let body = subscription::fetch(&sub.url).await?;
        let servers = subscription::parse_content(&body);
        info!("refreshed {}: {} servers", sub.name, servers.len());
        self.store.update_subscription_servers(&sub.id, servers)?;
        Ok(())
    }

    /// Refresh every subscription, collecting per-item outcomes instead of
    /// aborting on the first failure.
    pub async fn refresh_all(&self) -> Vec<RefreshResult> {
        let subs = self.store.list_subscriptions();
        let mut results = Vec::with_capacity(subs.len());
        for sub in subs {
            let status = match self.refresh_subscription(&sub.id).await {
                Ok(()) => "ok".to_string(),
                Err(e) => {
                    warn!("refresh {} failed: {e}", sub.id);
                    e.to_string()
                }
            };
            results.push(RefreshResult { id: sub.id, status });
        }
        results
    }

    // --- settings / dependencies --------------------------------------

    pub fn get_settings(&self) -> Settings {
        self.store.get_settings()
    }

    pub fn update_settings(&self, patch: Settings) -> VpnResult<Settings> {
        Ok(self.store.update_settings(patch)?)
    }

    /// Where a usable sing-box binary is, if anywhere.
    pub fn singbox_status(&self) -> SingBoxStatus {
        installer::locate(&self.store.get_settings().sing_box_path)
    }

    /// Install the latest engine release and persist its path.
    pub async fn install_singbox(&self) -> VpnResult<SingBoxStatus> {
        let status = installer::install_latest(self.store.data_dir()).await?;
        if let Some(path) = &status.path {
            let _ = self.store.update_settings(Settings {
                sing_box_path: path.clone(),
                ..Settings::default()
            });
        }
        Ok(status)
    }

    // --- state machine -------------------------------------------------

    pub async fn connect(&self, server_id: &str) -> VpnResult<()> {
        if server_id.is_empty() {
            return Err(VpnError::InvalidInput("server_id is required".to_string()));
        }
        let _op = self.op_lock.lock().await;

        {
            let state = self.state.lock();
            if state.status == Status::Connected
                && state.current_node.as_ref().map(|n| n.id.as_str()) == Some(server_id)
            {
                return Ok(());
            }
        }
        if self.state.lock().status == Status::Connected {
            self.teardown().await;
        }

        // A previous Error state may have left a config file behind.
        if let Some(stale) = self.state.lock().last_config_path.take() {
            let _ = fs::remove_file(stale);
        }

        let epoch = {
            let mut state = self.state.lock();
            state.status = Status::Connecting;
            state.last_error = None;
            state.epoch
        };

        match self.connect_pipeline(server_id, epoch).await {
            Ok((server, config_path)) => {
                {
                    let mut state = self.state.lock();
                    state.status = Status::Connected;
                    state.current_node = Some(server.clone());
                    state.last_config_path = Some(config_path);
                }
                self.remember_defaults(&server);
                info!("connected to {}", server.name);
                Ok(())
            }
            Err(VpnError::ConnectAborted) => {
                // The preempting Disconnect finalizes the state.
                Err(VpnError::ConnectAborted)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.status = Status::Error;
                state.current_node = None;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn connect_pipeline(
        &self,
        server_id: &str,
        epoch: u64,
    ) -> VpnResult<(ServerNode, PathBuf)> {
        let mut rollbacks: Vec<Rollback> = Vec::new();
        match self.connect_steps(server_id, epoch, &mut rollbacks).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.unwind(rollbacks).await;
                Err(e)
            }
        }
    }

    async fn connect_steps(
        &self,
        server_id: &str,
        epoch: u64,
        rollbacks: &mut Vec<Rollback>,
    ) -> VpnResult<(ServerNode, PathBuf)> {
        let server = self.store.get_server(server_id)?;
        if server.uri.is_empty() {
            return Err(VpnError::ServerHasNoUri);
        }
        self.check_cancelled(epoch)?;

        let outbound = build_outbound(&server.uri)?;
        let engine_config = config::render_config(outbound);

        let listen = config::proxy_listen();
        let port = config::proxy_port();
        ensure_port_available(&listen, port)?;

        let binary = self.singbox_status();
        let binary_path = match (binary.installed, binary.path) {
            (true, Some(path)) => PathBuf::from(path),
            _ => return Err(VpnError::EngineUnavailable),
        };

        let config_path = config::write_runtime_config(self.store.data_dir(), &engine_config)?;
        rollbacks.push(Rollback::RemoveFile(config_path.clone()));
        self.check_cancelled(epoch)?;

        self.supervisor
            .start(&binary_path, &config_path, Arc::clone(&self.logs))
            .await?;
        rollbacks.push(Rollback::StopChild);

        let watch = ConnectWatch {
            engine: self,
            epoch,
        };
        readiness::await_proxy_port("127.0.0.1", port, READINESS_DEADLINE, &watch).await?;

        rollbacks.push(Rollback::ProxyOff);
        sysproxy::enable(&listen, port);
        self.check_cancelled(epoch)?;

        Ok((server, config_path))
    }

    fn check_cancelled(&self, epoch: u64) -> VpnResult<()> {
        if self.state.lock().epoch != epoch {
            return Err(VpnError::ConnectAborted);
        }
        Ok(())
    }

    async fn unwind(&self, rollbacks: Vec<Rollback>) {
        for rollback in rollbacks.into_iter().rev() {
            match rollback {
                Rollback::RemoveFile(path) => {
                    let _ = fs::remove_file(path);
                }
                Rollback::StopChild => self.supervisor.stop().await,
                Rollback::ProxyOff => sysproxy::disable(),
            }
        }
    }

    /// Remember the last successful choice for auto-connect and the UI.
    fn remember_defaults(&self, server: &ServerNode) {
        let patch = Settings {
            default_server: server.id.clone(),
            default_config_id: self.store.find_owner(&server.id).unwrap_or_default(),
            ..Settings::default()
        };
        if let Err(e) = self.store.update_settings(patch) {
            warn!("persisting connect defaults failed: {e}");
        }
    }

    pub async fn disconnect(&self) -> VpnResult<()> {
        // Proxy off before anything else: an orchestrator killing the
        // daemon mid-stop must never leave a stray system proxy.
        sysproxy::disable();
        self.state.lock().epoch += 1;
        self.supervisor.stop().await;

        let _op = self.op_lock.lock().await;
        // A connect that spawned while we waited for the lock has unwound
        // by now; this covers the child it may have left.
        self.supervisor.stop().await;

        let config_path = {
            let mut state = self.state.lock();
            state.status = Status::Disconnected;
            state.current_node = None;
            state.last_error = None;
            state.last_config_path.take()
        };
        if let Some(path) = config_path {
            let _ = fs::remove_file(path);
        }
        info!("disconnected");
        Ok(())
    }

    /// Tear down the current session while already holding the op lock.
    async fn teardown(&self) {
        sysproxy::disable();
        self.supervisor.stop().await;
        let config_path = {
            let mut state = self.state.lock();
            state.status = Status::Disconnected;
            state.current_node = None;
            state.last_config_path.take()
        };
        if let Some(path) = config_path {
            let _ = fs::remove_file(path);
        }
    }

    /// Connect to the first known server.
    pub async fn quick_connect(&self) -> VpnResult<()> {
        let servers = self.store.list_servers();
        match servers.first() {
            Some(server) => {
                let id = server.id.clone();
                self.connect(&id).await
            }
            None => Err(VpnError::NoServersAvailable),
        }
    }

    /// Attempt a connect from saved defaults, used by `NEKKUS_AUTO_CONNECT`.
    pub async fn auto_connect(&self) {
        let settings = self.store.get_settings();
        let result = if !settings.default_server.is_empty() {
            self.connect(&settings.default_server).await
        } else {
            self.quick_connect().await
        };
        if let Err(e) = result {
            warn!("auto-connect failed: {e}");
        }
    }
}

/// Readiness-gate view of the engine: reports child exit (with stderr) and
/// preemption by a disconnect.
struct ConnectWatch<'a> {
    engine: &'a VpnEngine,
    epoch: u64,
}

impl ChildWatch for ConnectWatch<'_> {
    fn exited(&self) -> Option<String> {
        self.engine.supervisor.try_status().map(|status| {
            let tail = self.engine.supervisor.stderr_tail();
            if tail.is_empty() {
                format!("{status}")
            } else {
                format!("{status}\n{tail}")
            }
        })
    }

    fn cancelled(&self) -> bool {
        self.engine.state.lock().epoch != self.epoch
    }
}

/// Bind once to verify the inbound port is free before spawning the engine.
fn ensure_port_available(listen: &str, port: u16) -> VpnResult<()> {
    let addr = format!("{listen}:{port}");
    match std::net::TcpListener::bind(&addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(VpnError::ProxyPortBusy(addr)),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
