//! Remote content fetching
//!
//! The fetcher is the only network boundary of the crate: it turns a URL into
//! manifest text or payload bytes. No retries and no caching.

use crate::cancel::CancellationToken;
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching a URL
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure, including timeouts
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// IO error while reading the body
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Content too large
    #[error("Content too large: {size} bytes (max: {max})")]
    ContentTooLarge { size: u64, max: u64 },

    /// Body is not valid UTF-8 text
    #[error("Response from {0} is not valid UTF-8")]
    InvalidEncoding(String),

    /// Cancelled before or during the request
    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

/// Maximum response size (50 MB)
pub const MAX_CONTENT_SIZE: u64 = 50 * 1024 * 1024;

/// Default whole-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of remote content
///
/// Implementations must be shareable across the resolver's worker threads.
pub trait Fetcher: Send + Sync {
    /// Fetch raw bytes from `url`
    fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError>;

    /// Fetch a text document from `url`
    fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        let bytes = self.download(url, cancel)?;
        String::from_utf8(bytes).map_err(|_| FetchError::InvalidEncoding(url.to_string()))
    }
}

/// Blocking HTTP fetcher
pub struct HttpFetcher {
    client: Client,
    max_size: u64,
}

impl HttpFetcher {
    /// Create a fetcher with default limits
    pub fn new() -> Result<Self, FetchError> {
        Self::with_limits(REQUEST_TIMEOUT, CONNECT_TIMEOUT, MAX_CONTENT_SIZE)
    }

    /// Create a fetcher with custom timeouts and maximum body size
    pub fn with_limits(
        timeout: Duration,
        connect_timeout: Duration,
        max_size: u64,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(format!("script-pm/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, max_size })
    }
}

impl Fetcher for HttpFetcher {
    fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        validate_url(url)?;

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled(url.to_string()));
        }

        let response = self.client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_size {
                return Err(FetchError::ContentTooLarge {
                    size: len,
                    max: self.max_size,
                });
            }
        }

        // Read with size limit
        let mut content = Vec::new();
        let mut reader = response.take(self.max_size + 1);
        reader.read_to_end(&mut content)?;

        if content.len() as u64 > self.max_size {
            return Err(FetchError::ContentTooLarge {
                size: content.len() as u64,
                max: self.max_size,
            });
        }

        // A cancel that arrived mid-transfer discards the body.
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled(url.to_string()));
        }

        Ok(content)
    }
}

/// Reject anything that is not an absolute http(s) URL
pub fn validate_url(url: &str) -> Result<(), FetchError> {
    let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://dc.example.com/base.json").is_ok());
        assert!(validate_url("http://localhost:8080/repo.json").is_ok());
        assert!(matches!(validate_url("not-a-url"), Err(FetchError::InvalidUrl(_))));
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_invalid_url() {
        let fetcher = HttpFetcher::new().unwrap();
        let result = fetcher.fetch("not-a-url", &CancellationToken::new());
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_cancelled_before_request() {
        let fetcher = HttpFetcher::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher.download("https://example.invalid/repo.json", &cancel);
        assert!(matches!(result, Err(FetchError::Cancelled(_))));
    }
}
