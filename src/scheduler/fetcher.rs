//! Pooled, retrying requests shared by whole-page and tile downloads.
//!
//! Every HTTP request of a run, including probes, passes through
//! [`Fetcher::with_retry`]. A pool permit is held only for the duration of one
//! attempt, never across a backoff sleep and never for a whole page, so a
//! tiled page waiting on its tiles cannot starve the pool it is waiting on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::{DownloadJob, JobState};
use crate::download::{
    ContentExpectation, FailureType, FetchError, HttpClient, ProbeMethod, ProbeOutcome,
    RateLimiter, RetryDecision, RetryPolicy, classify_error, parse_retry_after,
    validate_image_body,
};
use crate::progress::ProgressEvent;
use crate::raster::ImageKind;

/// Run-scoped signals every worker observes.
///
/// `stall` is a child of `cancel`: cancelling the run also trips every
/// chunk's stall token, while a stall abort leaves the run alive.
#[derive(Debug, Clone)]
pub struct RunSignals {
    cancel: CancellationToken,
    stall: CancellationToken,
    escalation: Arc<AtomicU32>,
    events: mpsc::UnboundedSender<ProgressEvent>,
}

impl RunSignals {
    /// Creates signals for one chunk of a run.
    #[must_use]
    pub fn new(cancel: &CancellationToken, events: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            cancel: cancel.clone(),
            stall: cancel.child_token(),
            escalation: Arc::new(AtomicU32::new(0)),
            events,
        }
    }

    /// Abandons every outstanding request of this chunk.
    pub fn abort_stalled(&self) {
        self.stall.cancel();
    }

    /// Grants every job one attempt beyond its retry limit. Returns the new bonus.
    pub fn escalate(&self) -> u32 {
        self.escalation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Extra attempts granted by stuck escalation so far.
    #[must_use]
    pub fn escalation(&self) -> u32 {
        self.escalation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled or the chunk is aborted as stalled.
    pub async fn interrupted(&self) {
        self.stall.cancelled().await;
    }

    /// Returns the interruption error for `url` if the run or chunk was stopped.
    fn check(&self, url: &str) -> Result<(), FetchError> {
        if self.stall.is_cancelled() {
            return Err(self.interruption(url));
        }
        Ok(())
    }

    fn interruption(&self, url: &str) -> FetchError {
        if self.cancel.is_cancelled() {
            FetchError::cancelled(url)
        } else {
            FetchError::stalled(url)
        }
    }

    /// Sends a progress event. A closed receiver means nobody is listening.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.events.send(event);
    }
}

/// Per-request options for [`Fetcher::fetch_image`].
#[derive(Debug, Clone, Copy)]
pub struct ImageRequest<'a> {
    pub url: &'a str,
    /// Page the bytes are credited to in progress events.
    pub page_index: usize,
    pub expectation: &'a ContentExpectation,
    /// Retry placeholder payloads as transient failures (tile servers
    /// sometimes answer with a stub while a tile is still rendering).
    pub retry_invalid: bool,
}

/// Pooled HTTP access with retry, backoff, and politeness.
#[derive(Debug)]
pub struct Fetcher {
    client: HttpClient,
    pool: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl Fetcher {
    /// Creates a fetcher whose pool admits `concurrency` simultaneous requests.
    #[must_use]
    pub fn new(
        client: HttpClient,
        concurrency: usize,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
            limiter,
            retry,
            request_timeout,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Fetches and validates one image, retrying transient failures.
    ///
    /// When `job` is given it is moved through `InFlight`/`Retrying` and each
    /// change is emitted; terminal states are left to the caller.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once retries are exhausted or the
    /// failure is permanent, or an interruption error on cancel or stall.
    pub async fn fetch_image(
        &self,
        request: ImageRequest<'_>,
        job: Option<&mut DownloadJob>,
        signals: &RunSignals,
    ) -> Result<(ImageKind, Vec<u8>), FetchError> {
        let ImageRequest {
            url,
            page_index,
            expectation,
            retry_invalid,
        } = request;
        let client = &self.client;
        let timeout = self.request_timeout;

        self.with_retry(url, page_index, job, retry_invalid, signals, move || async move {
            let body = client
                .fetch(url, timeout, |n| {
                    signals.emit(ProgressEvent::bytes(page_index, n));
                })
                .await?;
            let kind = validate_image_body(url, &body.bytes, expectation)?;
            Ok((kind, body.bytes))
        })
        .await
    }

    /// Probes `url` through the pool, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once retries are exhausted.
    pub async fn probe(
        &self,
        url: &str,
        method: ProbeMethod,
        expectation: &ContentExpectation,
        signals: &RunSignals,
    ) -> Result<ProbeOutcome, FetchError> {
        let client = &self.client;
        let timeout = self.request_timeout;
        self.with_retry(url, usize::MAX, None, false, signals, move || async move {
            client.probe(url, method, expectation, timeout).await
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        url: &str,
        page_index: usize,
        mut job: Option<&mut DownloadJob>,
        retry_invalid: bool,
        signals: &RunSignals,
        mut attempt_fn: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            signals.check(url)?;

            let permit = tokio::select! {
                biased;
                () = signals.interrupted() => return Err(signals.interruption(url)),
                permit = self.pool.acquire() => permit.map_err(|_| FetchError::cancelled(url))?,
            };
            tokio::select! {
                biased;
                () = signals.interrupted() => return Err(signals.interruption(url)),
                () = self.limiter.acquire(url) => {}
            }

            if let Some(job) = job.as_deref_mut() {
                match job.begin_attempt() {
                    Ok(()) => signals.emit(ProgressEvent::state(page_index, JobState::InFlight)),
                    Err(e) => warn!(error = %e, "job state out of sync"),
                }
            }

            let result = tokio::select! {
                biased;
                () = signals.interrupted() => Err(signals.interruption(url)),
                result = attempt_fn() => result,
            };
            drop(permit);

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if matches!(e, FetchError::Cancelled { .. } | FetchError::Stalled { .. }) => {
                    return Err(e);
                }
                Err(e) => e,
            };

            let failure_type = match (&error, retry_invalid) {
                (FetchError::InvalidContent { .. }, true) => FailureType::Transient,
                _ => classify_error(&error),
            };
            let attempt_limit = self.retry.max_attempts() + signals.escalation();

            match self
                .retry
                .should_retry_within(failure_type, attempt, attempt_limit)
            {
                RetryDecision::Retry { delay, .. } => {
                    let delay = self.honor_retry_after(url, &error).await.unwrap_or(delay);
                    if let Some(job) = job.as_deref_mut() {
                        match job.transition(JobState::Retrying) {
                            Ok(()) => {
                                signals.emit(ProgressEvent::state(page_index, JobState::Retrying));
                            }
                            Err(e) => warn!(error = %e, "job state out of sync"),
                        }
                    }
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "request failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = signals.interrupted() => return Err(signals.interruption(url)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, attempt, reason, error = %error, "giving up on request");
                    return Err(error);
                }
            }
        }
    }

    /// Applies a 429 `Retry-After` to the whole host and returns it as the delay.
    async fn honor_retry_after(&self, url: &str, error: &FetchError) -> Option<Duration> {
        let FetchError::HttpStatus {
            status: 429,
            retry_after: Some(value),
            ..
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(value)?;
        self.limiter.hold(url, delay).await;
        Some(delay)
    }
}
