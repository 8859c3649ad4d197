//! Dependency installer - locating and installing the sing-box engine
//!
//! Resolution order for an existing binary: `NEKKUS_SINGBOX_PATH` env
//! override, the saved settings path, a `sing-box/` directory next to the
//! daemon executable ("download and go" bundles), then `PATH`.
//! `install_latest` downloads the newest upstream release, extracts it with
//! traversal checks and installs it under `<data>/tools/sing-box/`.

pub mod archive;
pub mod manifest;

use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Installer errors
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("release manifest returned status {0}")]
    HttpStatus(u16),

    #[error("bad release manifest: {0}")]
    BadManifest(String),

    #[error("no release asset for {0}")]
    NoAsset(String),

    #[error("unsupported archive type: {0}")]
    UnsupportedArchive(String),

    #[error("archive entry escapes extraction root: {0}")]
    PathTraversal(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("sing-box binary not found after extraction")]
    BinaryNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where (and whether) a usable engine binary was found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingBoxStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// One of "env", "settings", "bundled", "path", "installed".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SingBoxStatus {
    fn found(path: PathBuf, source: &str) -> Self {
        Self {
            installed: true,
            path: Some(path.display().to_string()),
            version: None,
            source: Some(source.to_string()),
        }
    }
}

pub fn binary_name() -> &'static str {
    if cfg!(windows) {
        "sing-box.exe"
    } else {
        "sing-box"
    }
}

fn is_file(path: &Path) -> bool {
    path.is_file()
}

/// Resolve a configured value that may be an absolute path or a bare
/// command name.
fn resolve_candidate(value: &str) -> Option<PathBuf> {
    let path = Path::new(value);
    if is_file(path) {
        return Some(path.to_path_buf());
    }
    if path.components().count() == 1 {
        return search_path(value);
    }
    None
}

/// Plain `PATH` lookup; on Windows also tries the `.exe` suffix.
fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_file(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) && !name.ends_with(".exe") {
            let candidate = dir.join(format!("{name}.exe"));
            if is_file(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

/// `sing-box/` directory next to the daemon executable.
fn bundled_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("sing-box").join(binary_name());
    is_file(&candidate).then_some(candidate)
}

/// Locate the engine binary. `settings_path` is the persisted
/// `sing_box_path` value (may be empty).
pub fn locate(settings_path: &str) -> SingBoxStatus {
    if let Ok(env_path) = std::env::var("NEKKUS_SINGBOX_PATH") {
        if !env_path.trim().is_empty() {
            if let Some(path) = resolve_candidate(env_path.trim()) {
                return SingBoxStatus::found(path, "env");
            }
        }
    }

    if !settings_path.is_empty() {
        if let Some(path) = resolve_candidate(settings_path) {
            return SingBoxStatus::found(path, "settings");
        }
    }

    if let Some(path) = bundled_path() {
        return SingBoxStatus::found(path, "bundled");
    }

    if let Some(path) = search_path("sing-box") {
        return SingBoxStatus::found(path, "path");
    }

    SingBoxStatus::default()
}

fn install_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("tools").join("sing-box")
}

/// Download and install the latest upstream release. Returns the status of
/// the freshly installed binary (source "installed").
pub async fn install_latest(data_dir: &Path) -> Result<SingBoxStatus, InstallError> {
    let release = manifest::fetch_latest().await?;
    let asset = manifest::select_asset(&release)?;
    info!("installing sing-box {} ({})", release.tag_name, asset.name);

    let archive_path = manifest::download_to_temp(&asset.browser_download_url).await?;
    let extract_dir = std::env::temp_dir().join(format!(
        "nekkus-singbox-extract-{}-{}",
        std::process::id(),
        release.tag_name.trim_start_matches('v')
    ));
    let _ = fs::remove_dir_all(&extract_dir);
    fs::create_dir_all(&extract_dir)?;

    let result = extract_and_install(&asset.name, &archive_path, &extract_dir, data_dir);
    let _ = fs::remove_file(&archive_path);
    let _ = fs::remove_dir_all(&extract_dir);

    let final_path = result?;
    Ok(SingBoxStatus {
        installed: true,
        path: Some(final_path.display().to_string()),
        version: Some(release.tag_name.trim_start_matches('v').to_string()),
        source: Some("installed".to_string()),
    })
}

fn extract_and_install(
    asset_name: &str,
    archive_path: &Path,
    extract_dir: &Path,
    data_dir: &Path,
) -> Result<PathBuf, InstallError> {
    if asset_name.ends_with(".zip") {
        archive::extract_zip(archive_path, extract_dir)?;
    } else if asset_name.ends_with(".tar.gz") {
        archive::extract_tar_gz(archive_path, extract_dir)?;
    } else {
        return Err(InstallError::UnsupportedArchive(asset_name.to_string()));
    }

    let bin_path =
        archive::find_file(extract_dir, binary_name()).ok_or(InstallError::BinaryNotFound)?;
    let bin_dir = bin_path.parent().unwrap_or(extract_dir);

    let target = install_dir(data_dir);
    fs::create_dir_all(&target)?;
    copy_dir_files(bin_dir, &target)?;

    let final_path = target.join(binary_name());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&final_path, fs::Permissions::from_mode(0o755))?;
    }
    info!("sing-box installed at {}", final_path.display());
    Ok(final_path)
}

/// Copy the binary and its sibling files (geoip databases, licenses) into
/// the install directory. Non-recursive on purpose.
fn copy_dir_files(src: &Path, dst: &Path) -> Result<(), InstallError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        fs::copy(entry.path(), dst.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_with_nothing_configured() {
        // No env override and no settings path: either nothing is found or
        // a real binary on PATH is reported with the right source.
        let status = locate("");
        if status.installed {
            assert!(matches!(
                status.source.as_deref(),
                Some("env") | Some("bundled") | Some("path")
            ));
        } else {
            assert!(status.path.is_none());
        }
    }

    #[test]
    fn test_resolve_candidate_missing_file() {
        assert!(resolve_candidate("/definitely/not/here/sing-box").is_none());
    }

    #[test]
    fn test_status_serialization_skips_empty() {
        let status = SingBoxStatus::default();
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"installed":false}"#);
    }
}
