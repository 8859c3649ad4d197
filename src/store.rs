//! Store - persisted subscriptions, server nodes and user settings
//!
//! All durable state lives in two JSON files under the data directory:
//! `subscriptions.json` and `settings.json`. The store keeps an in-memory
//! snapshot guarded by a readers-writer lock; every mutation serializes the
//! snapshot and atomically replaces the target file.

use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const SETTINGS_FILE: &str = "settings.json";

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state in {file}: {source}")]
    CorruptState {
        file: String,
        source: serde_json::Error,
    },

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single reachable proxy endpoint, parsed out of a subscription body.
///
/// Immutable once created; replaced wholesale when the owning subscription
/// refreshes. `uri` is the original scheme-prefixed link and is required for
/// Connect; YAML-only entries carry an empty `uri` and are rejected there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub ping: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

/// A named subscription URL whose body resolves to a list of server nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub servers: Vec<ServerNode>,
    pub updated_at: i64,
    /// Last refresh failure, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unix time of the last successful refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
}

/// Persistent user configuration. Updates merge field-by-field; empty
/// strings in a patch never overwrite an existing value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Full path to the sing-box binary. Empty means: resolve via
    /// `NEKKUS_SINGBOX_PATH`, the bundled directory or `PATH`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sing_box_path: String,
    /// Subscription the UI last connected through.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_config_id: String,
    /// Server the UI last connected to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_server: String,
}

struct StoreInner {
    subscriptions: Vec<Subscription>,
    settings: Settings,
}

/// Thread-safe persistent store for subscriptions and settings.
pub struct Store {
    data_dir: PathBuf,
    inner: RwLock<StoreInner>,
}

impl Store {
    /// Open (or initialize) the store rooted at `data_dir`. Missing files
    /// are not an error; malformed JSON is surfaced as `CorruptState`.
    pub fn open(data_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let subscriptions = load_json::<Vec<Subscription>>(&data_dir.join(SUBSCRIPTIONS_FILE))?
            .unwrap_or_default();
        let settings =
            load_json::<Settings>(&data_dir.join(SETTINGS_FILE))?.unwrap_or_default();

        debug!(
            "store opened at {:?} ({} subscriptions)",
            data_dir,
            subscriptions.len()
        );

        Ok(Self {
            data_dir,
            inner: RwLock::new(StoreInner {
                subscriptions,
                settings,
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn get_settings(&self) -> Settings {
        self.inner.read().settings.clone()
    }

    /// Merge non-empty fields of `patch` into the current settings and
    /// persist the result.
    pub fn update_settings(&self, patch: Settings) -> StoreResult<Settings> {
        let mut inner = self.inner.write();
        if !patch.sing_box_path.is_empty() {
            inner.settings.sing_box_path = patch.sing_box_path;
        }
        if !patch.default_config_id.is_empty() {
            inner.settings.default_config_id = patch.default_config_id;
        }
        if !patch.default_server.is_empty() {
            inner.settings.default_server = patch.default_server;
        }
        let next = inner.settings.clone();
        write_json(&self.data_dir.join(SETTINGS_FILE), &next)?;
        Ok(next)
    }

    /// All subscriptions in insertion order. Never null.
    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.inner.read().subscriptions.clone()
    }

    pub fn get_subscription(&self, id: &str) -> StoreResult<Subscription> {
        self.inner
            .read()
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::SubscriptionNotFound(id.to_string()))
    }

    /// Create a subscription with an empty server list. The id is derived
    /// from wall-clock nanoseconds plus a sequence number so concurrent adds
    /// within the same tick stay unique.
    pub fn add_subscription(&self, name: &str, url: &str) -> StoreResult<Subscription> {
        let mut inner = self.inner.write();
        let now = unix_now();
        let id = format!("sub-{}-{}", unix_nanos(), inner.subscriptions.len());
        let sub = Subscription {
            id,
            name: name.to_string(),
            url: url.to_string(),
            servers: Vec::new(),
            updated_at: now,
            last_error: None,
            last_success: None,
        };
        inner.subscriptions.push(sub.clone());
        write_json(&self.data_dir.join(SUBSCRIPTIONS_FILE), &inner.subscriptions)?;
        info!("added subscription {} ({})", sub.name, sub.id);
        Ok(sub)
    }

    /// Replace the server list of a subscription after a successful refresh.
    pub fn update_subscription_servers(
        &self,
        id: &str,
        servers: Vec<ServerNode>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let sub = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::SubscriptionNotFound(id.to_string()))?;
        let now = unix_now();
        sub.servers = servers;
        sub.updated_at = now;
        sub.last_error = None;
        sub.last_success = Some(now);
        write_json(&self.data_dir.join(SUBSCRIPTIONS_FILE), &inner.subscriptions)?;
        Ok(())
    }

    /// Record a failed refresh without touching the server list.
    pub fn mark_refresh_failed(&self, id: &str, error: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let sub = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::SubscriptionNotFound(id.to_string()))?;
        sub.updated_at = unix_now();
        sub.last_error = Some(error.to_string());
        write_json(&self.data_dir.join(SUBSCRIPTIONS_FILE), &inner.subscriptions)?;
        Ok(())
    }

    /// All servers flattened across subscriptions, duplicates by id
    /// suppressed, subscription order preserved.
    pub fn list_servers(&self) -> Vec<ServerNode> {
        let inner = self.inner.read();
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for sub in &inner.subscriptions {
            for node in &sub.servers {
                if !node.id.is_empty() && seen.insert(node.id.clone()) {
                    result.push(node.clone());
                }
            }
        }
        result
    }

    /// Look up a server by id first, then by name within each subscription.
    pub fn get_server(&self, id_or_name: &str) -> StoreResult<ServerNode> {
        let inner = self.inner.read();
        for sub in &inner.subscriptions {
            if let Some(node) = sub.servers.iter().find(|n| n.id == id_or_name) {
                return Ok(node.clone());
            }
        }
        for sub in &inner.subscriptions {
            if let Some(node) = sub.servers.iter().find(|n| n.name == id_or_name) {
                return Ok(node.clone());
            }
        }
        Err(StoreError::ServerNotFound(id_or_name.to_string()))
    }

    /// Id of the subscription owning a server, if any.
    pub fn find_owner(&self, server_id: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .subscriptions
            .iter()
            .find(|s| s.servers.iter().any(|n| n.id == server_id))
            .map(|s| s.id.clone())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_str(&data).map_err(|source| StoreError::CorruptState {
        file: path.display().to_string(),
        source,
    })?;
    Ok(Some(value))
}

/// Serialize `value` and atomically replace `path` (write-to-temp + rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::CorruptState {
        file: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = create_private(&tmp)?;
        file.write_all(&data)?;
        file.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
