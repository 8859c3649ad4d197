//! Release manifest handling
//!
//! Fetches the upstream release description and picks the right asset for
//! the running OS/architecture.

use super::InstallError;
use futures_util::StreamExt;
use log::{debug, info};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const RELEASE_MANIFEST_URL: &str =
    "https://api.github.com/repos/SagerNet/sing-box/releases/latest";

/// Deadline for the manifest request.
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the asset download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

pub async fn fetch_latest() -> Result<Release, InstallError> {
    let client = reqwest::Client::builder()
        .user_agent("nekkus-net")
        .timeout(MANIFEST_TIMEOUT)
        .build()?;

    let response = client
        .get(RELEASE_MANIFEST_URL)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(InstallError::HttpStatus(status.as_u16()));
    }

    let release: Release = response.json().await?;
    if release.tag_name.is_empty() {
        return Err(InstallError::BadManifest(
            "missing tag_name in release response".to_string(),
        ));
    }
    Ok(release)
}

/// Archive suffix for an OS/arch pair, using the manifest's arch naming.
pub fn platform_suffix(os: &str, arch: &str) -> Result<String, InstallError> {
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    match os {
        "windows" => Ok(format!("windows-{arch}.zip")),
        "linux" => Ok(format!("linux-{arch}.tar.gz")),
        "macos" => Ok(format!("darwin-{arch}.tar.gz")),
        other => Err(InstallError::NoAsset(format!("unsupported os: {other}"))),
    }
}

/// Pick the asset for the current platform: suffix match, non-"legacy"
/// builds preferred, first among ties.
pub fn select_asset(release: &Release) -> Result<&Asset, InstallError> {
    let suffix = platform_suffix(std::env::consts::OS, std::env::consts::ARCH)?;
    select_asset_for(release, &suffix)
}

pub fn select_asset_for<'a>(
    release: &'a Release,
    suffix: &str,
) -> Result<&'a Asset, InstallError> {
    if let Some(asset) = release
        .assets
        .iter()
        .find(|a| a.name.ends_with(suffix) && !a.name.contains("legacy"))
    {
        return Ok(asset);
    }
    release
        .assets
        .iter()
        .find(|a| a.name.ends_with(suffix))
        .ok_or_else(|| InstallError::NoAsset(suffix.to_string()))
}

/// Download an asset to a temp file. Streamed to disk; callers clean up.
pub async fn download_to_temp(url: &str) -> Result<PathBuf, InstallError> {
    let client = reqwest::Client::builder()
        .user_agent("nekkus-net")
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(InstallError::HttpStatus(status.as_u16()));
    }
    let total = response.content_length().unwrap_or(0);
    info!("downloading {url} ({total} bytes)");

    let path = std::env::temp_dir().join(format!(
        "nekkus-singbox-{}-{}.download",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));

    let mut file = std::fs::File::create(&path)?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        if let Err(e) = file.write_all(&chunk) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }
        downloaded += chunk.len() as u64;
    }
    file.flush()?;
    debug!("downloaded {downloaded} bytes to {}", path.display());
    Ok(path)
}
