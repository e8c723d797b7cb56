//! HTTP layer for page and tile retrieval.
//!
//! This module owns everything that talks to an image server for a single
//! request: the streaming [`HttpClient`], existence probes, content
//! validation, retry classification, and per-host politeness.
//!
//! # Features
//!
//! - Streaming bodies with per-chunk byte callbacks
//! - Range or HEAD probes that treat zero-byte phantoms as missing
//! - Error classification into transient, rate-limited, and permanent failures
//! - Exponential backoff with jitter and `Retry-After` support
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use folio_core::download::{ContentExpectation, HttpClient, ProbeMethod};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let outcome = client
//!     .probe(
//!         "https://iiif.example.org/book/p0042.jpg",
//!         ProbeMethod::RangeGet,
//!         &ContentExpectation::image(1024),
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//! println!("page 42 exists: {}", outcome.exists);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
pub mod rate_limiter;
mod retry;
mod validate;

pub use client::{FetchedBody, HttpClient, ProbeMethod, ProbeOutcome};
pub use error::FetchError;
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use validate::{ContentExpectation, validate_image_body};
