//! VPN Module for Nekkus Net
//!
//! The connection state machine and everything it orchestrates:
//!
//! - engine.rs: facade + state machine (Connect/Disconnect/QuickConnect)
//! - config.rs: sing-box config emission and runtime temp files
//! - supervisor.rs: child process lifecycle and log forwarding
//! - readiness.rs: wait for the local proxy port before going Connected
//! - sysproxy.rs: host system proxy binding (Windows registry; no-op elsewhere)
//! - traffic.rs: per-interface byte counters and rolling speeds
//! - logbuf.rs: bounded ring buffer for engine output

pub mod config;
pub mod engine;
pub mod logbuf;
pub mod readiness;
pub mod supervisor;
pub mod sysproxy;
pub mod traffic;

pub use engine::{Status, VpnEngine};
pub use logbuf::LogBuffer;
pub use traffic::TrafficStats;

use crate::installer::InstallError;
use crate::outbound::OutboundError;
use crate::store::StoreError;
use crate::subscription::FetchError;

/// VPN-related errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid server uri: {0}")]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("server has no uri (refresh the subscription to fetch full links)")]
    ServerHasNoUri,

    #[error("sing-box not found: install it via the API or set NEKKUS_SINGBOX_PATH / settings.sing_box_path")]
    EngineUnavailable,

    #[error("sing-box start error: {0}")]
    EngineStartFailure(String),

    #[error("proxy port is busy: {0}")]
    ProxyPortBusy(String),

    #[error("proxy {addr} did not come up within {secs}s (check the config or sing-box logs)")]
    ReadinessDeadline { addr: String, secs: u64 },

    #[error("sing-box exited before the proxy came up: {0}")]
    ChildExitedEarly(String),

    #[error("connect cancelled by disconnect")]
    ConnectAborted,

    #[error("no servers available")]
    NoServersAvailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VpnResult<T> = Result<T, VpnError>;
