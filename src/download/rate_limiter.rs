//! Per-host politeness gate for page and tile requests.
//!
//! Many image services tolerate a handful of parallel connections but throttle
//! bursts. The [`RateLimiter`] spaces requests to the same host by a minimum
//! delay and, after a 429 with `Retry-After`, holds every worker targeting that
//! host until the server-mandated pause has elapsed. Different hosts never wait
//! on each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use folio_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("https://tiles.example.org/0/0_0.jpg").await;
//! limiter.acquire("https://tiles.example.org/0/1_0.jpg").await; // waits ~250ms
//! limiter.acquire("https://other.example.net/p1.jpg").await; // immediate
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::MAX_RETRY_AFTER;

/// Per-host request spacing shared by every worker of a run.
///
/// Designed to live behind an `Arc`. Host entries are cloned out of the
/// `DashMap` before awaiting so no shard lock is held across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum delay between requests to the same host.
    min_delay: Duration,

    /// Per-host timing state.
    hosts: DashMap<String, Arc<HostGate>>,
}

#[derive(Debug, Default)]
struct HostGate {
    /// Earliest instant the next request to this host may start.
    /// `None` until the host has been contacted.
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter spacing same-host requests by `min_delay`.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = min_delay.as_millis()))]
    pub fn new(min_delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            min_delay,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that only enforces server-mandated `Retry-After` pauses.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns the configured minimum same-host delay.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    fn gate(&self, host: &str) -> Arc<HostGate> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostGate::default()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then reserves the slot.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_host(url);
        tracing::Span::current().record("host", &host);

        let gate = self.gate(&host);
        let mut next_allowed = gate.next_allowed.lock().await;

        if let Some(at) = *next_allowed {
            let now = Instant::now();
            if at > now {
                debug!(host = %host, delay_ms = (at - now).as_millis(), "spacing request");
                tokio::time::sleep_until(at).await;
            }
        }

        *next_allowed = Some(Instant::now() + self.min_delay);
    }

    /// Holds every request to `url`'s host for `delay` (from a `Retry-After` header).
    pub async fn hold(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        let gate = self.gate(&host);
        let mut next_allowed = gate.next_allowed.lock().await;

        let until = Instant::now() + delay;
        if next_allowed.is_none_or(|at| at < until) {
            *next_allowed = Some(until);
        }
        debug!(host = %host, delay_ms = delay.as_millis(), "holding host after rate limit");
    }
}

/// Extracts the lower-cased host from a URL, or `"unknown"` when unparseable.
///
/// ```
/// use folio_core::download::rate_limiter::extract_host;
///
/// assert_eq!(extract_host("https://IIIF.Example.org/a/b.jpg"), "iiif.example.org");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` when unparseable; values above one hour are capped.
///
/// ```
/// use std::time::Duration;
/// use folio_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("garbage"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(cap_retry_after(Duration::from_secs(seconds)));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => {
            let delay = datetime
                .duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO);
            Some(cap_retry_after(delay))
        }
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

fn cap_retry_after(delay: Duration) -> Duration {
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        delay
    }
}
