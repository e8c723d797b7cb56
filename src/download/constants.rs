//! Constants for the download module (timeouts, probing, rate limiting).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Base per-request timeout before the source's multiplier is applied.
pub const BASE_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Number of body bytes requested by a range probe.
pub const PROBE_RANGE_BYTES: u64 = 1024;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
