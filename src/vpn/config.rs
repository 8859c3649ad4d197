//! Engine config emission
//!
//! Assembles the full sing-box config around a translated outbound and
//! writes it to a uniquely named file under `<data>/runtime/`. Inbound
//! host/port and the engine-side system-proxy flag come from the
//! environment with sane defaults.

use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_PROXY_LISTEN: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 7890;

/// Inbound listen host (`NEKKUS_PROXY_LISTEN`).
pub fn proxy_listen() -> String {
    match std::env::var("NEKKUS_PROXY_LISTEN") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => DEFAULT_PROXY_LISTEN.to_string(),
    }
}

/// Inbound listen port (`NEKKUS_PROXY_PORT`). Out-of-range values fall back
/// to the default.
pub fn proxy_port() -> u16 {
    std::env::var("NEKKUS_PROXY_PORT")
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_PROXY_PORT)
}

/// Whether the engine should bind the system proxy itself
/// (`NEKKUS_SET_SYSTEM_PROXY`, default on).
pub fn engine_sets_system_proxy() -> bool {
    env_truthy("NEKKUS_SET_SYSTEM_PROXY", true)
}

/// Boolean environment flag with a default for unset/empty values.
pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => parse_truthy(&v),
        _ => default,
    }
}

pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Render the full engine config around `outbound`. The outbound is tagged
/// `proxy` here; direct and block outbounds and the final route are fixed.
pub fn render_config(mut outbound: Value) -> Value {
    if let Some(obj) = outbound.as_object_mut() {
        obj.insert("tag".to_string(), json!("proxy"));
    }
    json!({
        "log": {"level": "info"},
        "inbounds": [{
            "type": "mixed",
            "tag": "mixed-in",
            "listen": proxy_listen(),
            "listen_port": proxy_port(),
            "sniff": true,
            "sniff_override_destination": true,
            "set_system_proxy": engine_sets_system_proxy(),
        }],
        "outbounds": [
            outbound,
            {"type": "direct", "tag": "direct"},
            {"type": "block", "tag": "block"},
        ],
        "route": {"final": "proxy"},
    })
}

static CONFIG_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write a config to a fresh file under `<data>/runtime/` and return its
/// path. File names carry nanoseconds plus a sequence so concurrent writes
/// never collide.
pub fn write_runtime_config(data_dir: &Path, config: &Value) -> std::io::Result<PathBuf> {
    let dir = data_dir.join("runtime");
    fs::create_dir_all(&dir)?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = CONFIG_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("sing-box-{nanos}-{seq}.json"));

    let data = serde_json::to_vec_pretty(config)?;
    let mut file = fs::File::create(&path)?;
    file.write_all(&data)?;
    file.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_config_shape() {
        let outbound = json!({"type": "vless", "server": "h", "server_port": 443, "uuid": "U"});
        let config = render_config(outbound);

        assert_eq!(config["route"]["final"], "proxy");
        assert_eq!(config["log"]["level"], "info");

        let inbound = &config["inbounds"][0];
        assert_eq!(inbound["type"], "mixed");
        assert_eq!(inbound["tag"], "mixed-in");

        let outbounds = config["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 3);
        assert_eq!(outbounds[0]["tag"], "proxy");
        assert_eq!(outbounds[0]["type"], "vless");
        assert_eq!(outbounds[1], json!({"type": "direct", "tag": "direct"}));
        assert_eq!(outbounds[2], json!({"type": "block", "tag": "block"}));
    }

    #[test]
    fn test_parse_truthy() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", "off", "whatever"] {
            assert!(!parse_truthy(v), "{v} should be falsy");
        }
    }

    #[test]
    fn test_write_runtime_config_unique_paths() {
        let dir = std::env::temp_dir().join(format!(
            "nekkus-config-test-{}",
            std::process::id()
        ));
        let config = json!({"log": {"level": "info"}});
        let a = write_runtime_config(&dir, &config).unwrap();
        let b = write_runtime_config(&dir, &config).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.join("runtime")));
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }
}
