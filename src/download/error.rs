//! Error types for the download module.
//!
//! Every fetch failure carries the URL it happened on so per-page failure
//! reports can name the exact request that broke.

use thiserror::Error;

/// Errors that can occur while fetching a page, a tile, or a probe response.
#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS, connect, reset, or TLS failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete within its timeout.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        retry_after: Option<String>,
    },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The server answered 200 but the payload is not usable content
    /// (placeholder image, zero-byte phantom page, HTML error page).
    #[error("unusable content from {url}: {reason}")]
    InvalidContent {
        url: String,
        reason: String,
    },

    /// The run was cancelled while this request was pending or in flight.
    #[error("cancelled while fetching {url}")]
    Cancelled { url: String },

    /// Abandoned after two idle windows without progress.
    #[error("abandoned stalled request to {url}")]
    Stalled { url: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Keeps the raw `Retry-After` value for 429 and 503 responses.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn invalid_content(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContent {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    pub fn stalled(url: impl Into<String>) -> Self {
        Self::Stalled { url: url.into() }
    }

    /// Returns the URL the error is about.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::HttpStatus { url, .. }
            | Self::InvalidUrl { url }
            | Self::InvalidContent { url, .. }
            | Self::Cancelled { url }
            | Self::Stalled { url } => url,
        }
    }

    /// Returns true when the error is caused by run cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// No `From<reqwest::Error>`: every variant needs the URL, which the source
// error does not reliably carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_timeout_display() {
        let error = FetchError::timeout("https://example.com/page/1.jpg");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/page/1.jpg"));
    }

    #[test]
    fn test_fetch_error_http_status_display() {
        let error = FetchError::http_status("https://example.com/page/2.jpg", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected '503' in: {msg}");
        assert!(msg.contains("page/2.jpg"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_fetch_error_invalid_content_display() {
        let error = FetchError::invalid_content("https://example.com/t/0_0.jpg", "12 bytes");
        let msg = error.to_string();
        assert!(msg.contains("unusable content"));
        assert!(msg.contains("12 bytes"));
    }

    #[test]
    fn test_fetch_error_url_accessor() {
        let error = FetchError::stalled("https://example.com/x");
        assert_eq!(error.url(), "https://example.com/x");
        assert!(!error.is_cancelled());
        assert!(FetchError::cancelled("https://example.com/x").is_cancelled());
    }
}
