//! Subscription downloader

use super::FetchError;
use log::debug;
use std::time::Duration;

/// Total deadline for a subscription download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Download a subscription body. Plain GET with a 30-second deadline and no
/// retries; callers collect per-subscription outcomes on bulk refresh.
pub async fn fetch(url: &str) -> Result<String, FetchError> {
    let client = reqwest::Client::builder()
        .user_agent("nekkus-net")
        .timeout(FETCH_TIMEOUT)
        .build()?;

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }

    let body = response.text().await?;
    debug!("fetched {} bytes from {}", body.len(), url);
    Ok(body)
}
