//! Subscription handling - fetching and parsing proxy server lists
//!
//! A subscription is a URL whose body is a list of proxy URIs (plain,
//! base64-wrapped, or a Clash-style YAML `proxies:` document). `fetch`
//! downloads the body, `parse` turns it into server nodes.

pub mod fetch;
pub mod parse;

pub use fetch::fetch;
pub use parse::parse_content;

/// Subscription fetch errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("subscription returned status {0}")]
    HttpStatus(u16),
}
