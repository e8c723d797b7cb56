//! Page-count discovery for sources that cannot report their length.
//!
//! Existence is assumed monotonic: if page N exists, every page before it
//! does too. A doubling phase finds an upper bound, then a binary search
//! narrows it, for `O(log N)` probes in total. Servers that keep answering 200
//! past the real end are handled by the probe's content expectation, which
//! rejects zero-byte and undersized "phantom" pages.
//!
//! After discovery, [`trim_trailing_artifacts`] compares the size of the last
//! pages against a middle sample and drops a trailing run of suspiciously
//! small pages (blank end sheets, color targets, "page not available" stubs).
//! That step is a heuristic with configurable sample size and ratio.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::fetcher::{Fetcher, RunSignals};
use crate::download::{ContentExpectation, FetchError, ProbeMethod, ProbeOutcome};
use crate::manifest::PageDiscovery;

/// Pages sampled around the middle of the document for the tail check.
pub const MIDDLE_SAMPLE_SIZE: u32 = 5;

/// Answers existence questions about numbered pages.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Probes the page at 1-based `ordinal`.
    async fn probe(&self, ordinal: u32) -> Result<ProbeOutcome, FetchError>;
}

/// Probes pages built from a `{page}` URL template through the shared pool.
#[derive(Debug)]
pub struct UrlTemplateProbe {
    fetcher: Arc<Fetcher>,
    discovery: PageDiscovery,
    method: ProbeMethod,
    expectation: ContentExpectation,
    signals: RunSignals,
}

impl UrlTemplateProbe {
    #[must_use]
    pub fn new(
        fetcher: Arc<Fetcher>,
        discovery: PageDiscovery,
        method: ProbeMethod,
        expectation: ContentExpectation,
        signals: RunSignals,
    ) -> Self {
        Self {
            fetcher,
            discovery,
            method,
            expectation,
            signals,
        }
    }
}

#[async_trait]
impl PageProbe for UrlTemplateProbe {
    async fn probe(&self, ordinal: u32) -> Result<ProbeOutcome, FetchError> {
        let url = self.discovery.page_url(ordinal);
        self.fetcher
            .probe(&url, self.method, &self.expectation, &self.signals)
            .await
    }
}

/// Result of a page-count search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCount {
    /// Number of existing pages.
    pub count: u32,
    /// Probes issued to find it.
    pub probes: u32,
}

struct CountingProbe<'a> {
    inner: &'a dyn PageProbe,
    probes: AtomicU32,
}

impl CountingProbe<'_> {
    async fn exists(&self, ordinal: u32) -> Result<bool, FetchError> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.probe(ordinal).await?.exists)
    }
}

/// Finds the number of existing pages, at most `max_pages`.
///
/// # Errors
///
/// Returns the probe's [`FetchError`] when a probe fails after its retries.
#[instrument(skip(probe))]
pub async fn discover_page_count(
    probe: &dyn PageProbe,
    max_pages: u32,
) -> Result<DiscoveredCount, FetchError> {
    let counter = CountingProbe {
        inner: probe,
        probes: AtomicU32::new(0),
    };
    let count = search(&counter, max_pages).await?;
    let probes = counter.probes.load(Ordering::Relaxed);
    info!(count, probes, "page count discovered");
    Ok(DiscoveredCount { count, probes })
}

async fn search(probe: &CountingProbe<'_>, max_pages: u32) -> Result<u32, FetchError> {
    if max_pages == 0 || !probe.exists(1).await? {
        return Ok(0);
    }

    // Doubling phase: `lo` exists, find an `hi` that does not.
    let mut lo: u32 = 1;
    let mut hi: u32 = 2;
    loop {
        if hi > max_pages {
            if lo == max_pages || probe.exists(max_pages).await? {
                return Ok(max_pages);
            }
            hi = max_pages;
            break;
        }
        if !probe.exists(hi).await? {
            break;
        }
        lo = hi;
        hi = hi.saturating_mul(2);
    }

    // Binary search keeps exists(lo) and !exists(hi).
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if probe.exists(mid).await? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    debug!(lo, hi, "search converged");
    Ok(lo)
}

/// Drops a trailing run of undersized pages from a discovered `count`.
///
/// Skipped when the document is too short to hold both a middle sample and a
/// tail sample, or when no middle page reports its size.
///
/// # Errors
///
/// Returns the probe's [`FetchError`] when a sampling probe fails.
#[instrument(skip(probe))]
pub async fn trim_trailing_artifacts(
    probe: &dyn PageProbe,
    count: u32,
    tail_sample_size: u32,
    ratio: f64,
) -> Result<u32, FetchError> {
    if tail_sample_size == 0 || count <= tail_sample_size + MIDDLE_SAMPLE_SIZE {
        return Ok(count);
    }

    let middle = count / 2;
    let first_middle = middle.saturating_sub(MIDDLE_SAMPLE_SIZE / 2).max(1);
    let mut middle_sizes = Vec::with_capacity(MIDDLE_SAMPLE_SIZE as usize);
    for ordinal in first_middle..first_middle + MIDDLE_SAMPLE_SIZE {
        if let Some(len) = probe.probe(ordinal).await?.content_length {
            middle_sizes.push(len);
        }
    }
    if middle_sizes.is_empty() {
        debug!("middle sample reported no sizes, skipping tail check");
        return Ok(count);
    }
    #[allow(clippy::cast_precision_loss)]
    let middle_mean = middle_sizes.iter().sum::<u64>() as f64 / middle_sizes.len() as f64;

    let first_tail = count - tail_sample_size + 1;
    let mut tail_sizes = Vec::with_capacity(tail_sample_size as usize);
    for ordinal in first_tail..=count {
        let outcome = probe.probe(ordinal).await?;
        tail_sizes.push(if outcome.exists {
            outcome.content_length.unwrap_or(0)
        } else {
            0
        });
    }

    let run = trailing_artifact_run(&tail_sizes, middle_mean, ratio);
    if run > 0 {
        info!(
            trimmed = run,
            middle_mean, "trimming undersized trailing pages"
        );
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(count - run as u32)
}

/// Length of the run at the end of `tail_sizes` whose sizes are all below
/// `ratio × middle_mean`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn trailing_artifact_run(tail_sizes: &[u64], middle_mean: f64, ratio: f64) -> usize {
    let threshold = middle_mean * ratio;
    tail_sizes
        .iter()
        .rev()
        .take_while(|&&size| (size as f64) < threshold)
        .count()
}
