//! HTTP client wrapper for page, tile, and probe requests.
//!
//! `HttpClient` streams response bodies into memory while reporting byte
//! progress, and answers cheap existence probes used by page-count discovery
//! and tile-grid detection. Every call takes its own timeout so a source's
//! timeout multiplier applies per request.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, PROBE_RANGE_BYTES};
use super::error::FetchError;
use super::validate::ContentExpectation;
use crate::user_agent;

/// Upper bound on the body buffer reserved from a declared Content-Length.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// How existence probes ask the server about a URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeMethod {
    /// `HEAD` request; falls back to a range request when the server
    /// rejects `HEAD` or omits the length.
    Head,
    /// `GET` with `Range: bytes=0-1023`.
    #[default]
    RangeGet,
}

/// What a probe learned about a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Whether the URL serves real content under the probe's expectation.
    pub exists: bool,
    /// Full resource size when the server reported or revealed it.
    pub content_length: Option<u64>,
    /// Reported Content-Type header.
    pub content_type: Option<String>,
}

impl ProbeOutcome {
    fn missing() -> Self {
        Self {
            exists: false,
            content_length: None,
            content_type: None,
        }
    }
}

/// A fully read response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// Response bytes.
    pub bytes: Vec<u8>,
    /// Reported Content-Type header.
    pub content_type: Option<String>,
}

/// HTTP client shared by every worker of a run.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client with the default connect timeout and User-Agent.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetches `url` into memory, calling `on_bytes` with each received chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for malformed URLs, network failures, timeouts,
    /// and non-success statuses (with `Retry-After` captured for 429).
    #[instrument(skip(self, on_bytes), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        mut on_bytes: impl FnMut(u64) + Send,
    ) -> Result<FetchedBody, FetchError> {
        let response = self.send_request(Method::GET, url, None, timeout).await?;
        let content_type = header_string(&response, CONTENT_TYPE);
        let capacity = declared_length(&response).map_or(0, |len| len.min(MAX_PREALLOCATION));
        let mut bytes = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| map_transport_error(url, e))?;
            on_bytes(chunk.len() as u64);
            bytes.extend_from_slice(&chunk);
        }

        trace!(bytes = bytes.len(), "body received");
        Ok(FetchedBody {
            bytes,
            content_type,
        })
    }

    /// Asks whether `url` serves real content without downloading it.
    ///
    /// 404 and 410 answer "does not exist". Other error statuses are returned
    /// as errors so callers can retry them like any other request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport failures and unexpected statuses.
    #[instrument(skip(self, expectation), fields(url = %url, method = ?method))]
    pub async fn probe(
        &self,
        url: &str,
        method: ProbeMethod,
        expectation: &ContentExpectation,
        timeout: Duration,
    ) -> Result<ProbeOutcome, FetchError> {
        if method == ProbeMethod::Head
            && let Some(outcome) = self.probe_head(url, expectation, timeout).await?
        {
            return Ok(outcome);
        }
        self.probe_range(url, expectation, timeout).await
    }

    /// Returns `None` when the HEAD answer is inconclusive.
    async fn probe_head(
        &self,
        url: &str,
        expectation: &ContentExpectation,
        timeout: Duration,
    ) -> Result<Option<ProbeOutcome>, FetchError> {
        let response = match self.send_request(Method::HEAD, url, None, timeout).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status, .. }) if is_missing_status(status) => {
                return Ok(Some(ProbeOutcome::missing()));
            }
            Err(FetchError::HttpStatus { status: 405 | 501, .. }) => {
                debug!("HEAD rejected, falling back to range probe");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let content_length = declared_length(&response);
        let content_type = header_string(&response, CONTENT_TYPE);
        let type_verdict = expectation.content_type_matches(content_type.as_deref());
        if content_length.is_none() || type_verdict.is_none() {
            return Ok(None);
        }

        let exists = expectation.accepts_probe(content_length, content_type.as_deref(), &[]);
        Ok(Some(ProbeOutcome {
            exists,
            content_length,
            content_type,
        }))
    }

    async fn probe_range(
        &self,
        url: &str,
        expectation: &ContentExpectation,
        timeout: Duration,
    ) -> Result<ProbeOutcome, FetchError> {
        let range = format!("bytes=0-{}", PROBE_RANGE_BYTES - 1);
        let response = match self
            .send_request(Method::GET, url, Some(&range), timeout)
            .await
        {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status, .. })
                if is_missing_status(status) || status == 416 =>
            {
                return Ok(ProbeOutcome::missing());
            }
            Err(e) => return Err(e),
        };

        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let mut total = if partial {
            header_string(&response, CONTENT_RANGE)
                .as_deref()
                .and_then(parse_content_range_total)
        } else {
            declared_length(&response)
        };
        let content_type = header_string(&response, CONTENT_TYPE);

        // Servers that ignore Range send the whole body; stop early once the
        // length is known, otherwise count to the end.
        let head_limit = usize::try_from(PROBE_RANGE_BYTES).unwrap_or(usize::MAX);
        let mut head = Vec::new();
        let mut read: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| map_transport_error(url, e))?;
            read += chunk.len() as u64;
            if head.len() < head_limit {
                let take = (head_limit - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            if total.is_some() && head.len() >= head_limit {
                break;
            }
        }
        if total.is_none() && !partial {
            total = Some(read);
        }

        let exists = expectation.accepts_probe(total, content_type.as_deref(), &head);
        trace!(exists, total, "range probe answered");
        Ok(ProbeOutcome {
            exists,
            content_length: total,
            content_type,
        })
    }

    async fn send_request(
        &self,
        method: Method,
        url: &str,
        range_header: Option<&str>,
        timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::invalid_url(url));
        }

        let mut request = self.client.request(method, parsed).timeout(timeout);
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let retry_after = header_string(&response, RETRY_AFTER);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status_code,
                retry_after,
            ));
        }

        Ok(response)
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

fn is_missing_status(status: u16) -> bool {
    matches!(status, 404 | 410)
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// `Response::content_length` reports the decoded body hint, which is zero for
// HEAD; read the header itself.
fn declared_length(response: &reqwest::Response) -> Option<u64> {
    header_string(response, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

/// Extracts the total size from `Content-Range: bytes 0-1023/48213`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
