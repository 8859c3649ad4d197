//! Nekkus Net daemon
//!
//! Wires the store, the VPN engine and the control API together, then
//! waits for a shutdown signal. On exit the engine is disconnected so no
//! child process or system-proxy setting is left behind.

use log::{error, info, warn};
use nekkus_net::api::{ApiServer, DEFAULT_HTTP_ADDR};
use nekkus_net::store::Store;
use nekkus_net::vpn::{config, supervisor};
use nekkus_net::VpnEngine;
use std::path::PathBuf;
use std::sync::Arc;

const APP_DIR: &str = "nekkus-net";

/// Data directory: `NEKKUS_DATA_DIR`, else the platform data dir, else
/// `./data` as a last resort.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NEKKUS_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    dirs::data_local_dir()
        .map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // On Windows this binds the daemon to a kill-on-close job object so a
    // hard parent death also reaps the engine child.
    supervisor::ensure_children_reaped();

    let data_dir = resolve_data_dir();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let store = match Store::open(&data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open data dir {}: {e}", data_dir.display());
            std::process::exit(1);
        }
    };
    let engine = Arc::new(VpnEngine::new(store));

    let http_addr = std::env::var("NEKKUS_HTTP_ADDR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
    let mut api = match ApiServer::start(&http_addr, Arc::clone(&engine), runtime.handle().clone())
    {
        Ok(api) => api,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!(
        "nekkus-net ready at http://{} (data: {})",
        api.addr(),
        data_dir.display()
    );

    if config::env_truthy("NEKKUS_AUTO_CONNECT", false) {
        let engine = Arc::clone(&engine);
        runtime.spawn(async move {
            engine.auto_connect().await;
        });
    }

    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        warn!("signal listener failed: {e}");
    }
    info!("shutting down");

    if let Err(e) = runtime.block_on(engine.disconnect()) {
        warn!("disconnect on shutdown failed: {e}");
    }
    api.stop();
}
