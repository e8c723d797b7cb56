//! Adaptive download scheduler.
//!
//! The [`Scheduler`] turns a chunk's pages into concurrently running jobs and
//! streams back one [`PageResult`] per page, in completion order, each tagged
//! with its page index so the assembler can restore document order.
//!
//! # Overview
//!
//! - Whole-page images are fetched by the [`Fetcher`] with retry, backoff,
//!   and content validation.
//! - Tiled pages go through the [`TileStitcher`], whose tile requests share
//!   the same pool.
//! - Cancellation and stall aborts arrive through [`RunSignals`]; an
//!   interrupted page reports [`PageError::Cancelled`] or
//!   [`PageError::Stalled`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use folio_core::download::{HttpClient, ProbeMethod, RateLimiter, RetryPolicy};
//! use folio_core::manifest::Page;
//! use folio_core::scheduler::{Fetcher, RunSignals, Scheduler};
//! use folio_core::tiles::TileStitcher;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Arc::new(Fetcher::new(
//!     HttpClient::new()?,
//!     4,
//!     Arc::new(RateLimiter::disabled()),
//!     RetryPolicy::default(),
//!     Duration::from_secs(30),
//! ));
//! let stitcher = Arc::new(TileStitcher::new(Arc::clone(&fetcher), ProbeMethod::RangeGet, 64, 0.25));
//! let scheduler = Scheduler::new(fetcher, stitcher, 512);
//!
//! let (events, _progress) = mpsc::unbounded_channel();
//! let signals = RunSignals::new(&CancellationToken::new(), events);
//! let pages = vec![Page::direct(0, "https://img.example.org/1.jpg")];
//! let mut results = scheduler.dispatch(&pages, &signals);
//! while let Some(result) = results.recv().await {
//!     println!("page {} finished after {} attempt(s)", result.page_index, result.attempts);
//! }
//! # Ok(())
//! # }
//! ```

pub mod discovery;
mod fetcher;
mod job;

pub use discovery::{
    DiscoveredCount, PageProbe, UrlTemplateProbe, discover_page_count, trim_trailing_artifacts,
    trailing_artifact_run,
};
pub use fetcher::{Fetcher, ImageRequest, RunSignals};
pub use job::{DownloadJob, InvalidTransition, JobState};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, warn};

use crate::download::{ContentExpectation, FetchError};
use crate::manifest::{Page, SourceRef};
use crate::progress::ProgressEvent;
use crate::raster::PageImage;
use crate::tiles::{TileAssemblyError, TileStitcher};

/// Why a page produced no image.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("page {page_index}: {source}")]
    Fetch {
        page_index: usize,
        #[source]
        source: FetchError,
    },

    #[error("page {page_index}: {source}")]
    TileAssembly {
        page_index: usize,
        #[source]
        source: TileAssemblyError,
    },

    #[error("page {page_index}: cancelled")]
    Cancelled { page_index: usize },

    #[error("page {page_index}: abandoned after no progress for two idle windows")]
    Stalled { page_index: usize },
}

impl PageError {
    fn from_fetch(page_index: usize, source: FetchError) -> Self {
        match source {
            FetchError::Cancelled { .. } => Self::Cancelled { page_index },
            FetchError::Stalled { .. } => Self::Stalled { page_index },
            source => Self::Fetch { page_index, source },
        }
    }

    fn from_tiles(page_index: usize, source: TileAssemblyError) -> Self {
        match source {
            TileAssemblyError::Interrupted(fetch) => Self::from_fetch(page_index, fetch),
            source => Self::TileAssembly { page_index, source },
        }
    }

    #[must_use]
    pub fn page_index(&self) -> usize {
        match self {
            Self::Fetch { page_index, .. }
            | Self::TileAssembly { page_index, .. }
            | Self::Cancelled { page_index }
            | Self::Stalled { page_index } => *page_index,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Outcome of one page's job.
#[derive(Debug)]
pub struct PageResult {
    pub page_index: usize,
    /// Attempts started for whole-page fetches; 1 for tiled pages.
    pub attempts: u32,
    pub outcome: Result<PageImage, PageError>,
}

/// Runs page jobs on the shared pool.
#[derive(Debug, Clone)]
pub struct Scheduler {
    fetcher: Arc<Fetcher>,
    stitcher: Arc<TileStitcher>,
    page_expectation: ContentExpectation,
}

impl Scheduler {
    #[must_use]
    pub fn new(fetcher: Arc<Fetcher>, stitcher: Arc<TileStitcher>, min_page_bytes: u64) -> Self {
        Self {
            fetcher,
            stitcher,
            page_expectation: ContentExpectation::image(min_page_bytes),
        }
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Spawns one job per page and returns the stream of their results.
    ///
    /// The receiver yields exactly `pages.len()` results and then closes.
    /// Concurrency is bounded by the fetcher's pool, not by task count.
    pub fn dispatch(&self, pages: &[Page], signals: &RunSignals) -> mpsc::Receiver<PageResult> {
        let (tx, rx) = mpsc::channel(pages.len().max(1));
        for page in pages {
            let scheduler = self.clone();
            let page = page.clone();
            let signals = signals.clone();
            let tx = tx.clone();
            let span = info_span!("page", page_index = page.index);
            tokio::spawn(
                async move {
                    let result = scheduler.run_page(&page, &signals).await;
                    if tx.send(result).await.is_err() {
                        debug!("result receiver dropped");
                    }
                }
                .instrument(span),
            );
        }
        rx
    }

    async fn run_page(&self, page: &Page, signals: &RunSignals) -> PageResult {
        let page_index = page.index;
        let mut job = DownloadJob::new(page_index);
        signals.emit(ProgressEvent::state(page_index, JobState::Pending));

        let outcome = match &page.source_ref {
            SourceRef::DirectImage { url } => {
                let request = ImageRequest {
                    url,
                    page_index,
                    expectation: &self.page_expectation,
                    retry_invalid: false,
                };
                self.fetcher
                    .fetch_image(request, Some(&mut job), signals)
                    .await
                    .map(|(kind, bytes)| PageImage::encoded(page_index, kind, bytes))
                    .map_err(|e| PageError::from_fetch(page_index, e))
            }
            SourceRef::TileGrid(grid) => {
                if job.begin_attempt().is_ok() {
                    signals.emit(ProgressEvent::state(page_index, JobState::InFlight));
                }
                self.stitcher
                    .stitch(page_index, grid, signals)
                    .await
                    .map_err(|e| PageError::from_tiles(page_index, e))
            }
        };

        let terminal = if outcome.is_ok() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        if let Err(e) = job.transition(terminal) {
            warn!(error = %e, "job state out of sync");
        }
        signals.emit(ProgressEvent::state(page_index, terminal));
        if let Err(e) = &outcome {
            warn!(page_index, attempts = job.attempts(), error = %e, "page failed");
        }

        PageResult {
            page_index,
            attempts: job.attempts(),
            outcome,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::download::{HttpClient, ProbeMethod, RateLimiter, RetryPolicy};

    fn scheduler(concurrency: usize) -> Scheduler {
        let fetcher = Arc::new(Fetcher::new(
            HttpClient::new().unwrap(),
            concurrency,
            Arc::new(RateLimiter::disabled()),
            RetryPolicy::new(2, Duration::from_millis(2), Duration::from_millis(5), 2.0),
            Duration::from_secs(5),
        ));
        let stitcher = Arc::new(TileStitcher::new(
            Arc::clone(&fetcher),
            ProbeMethod::RangeGet,
            16,
            0.25,
        ));
        Scheduler::new(fetcher, stitcher, 16)
    }

    fn jpeg(len: usize) -> Vec<u8> {
        let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
        body.resize(len, 1);
        body
    }

    #[tokio::test]
    async fn test_every_page_reports_once_with_its_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ok/\d+\.jpg$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(jpeg(128))
                    .set_delay(Duration::from_millis(10)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/bad/\d+\.jpg$"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let pages: Vec<Page> = (0..12)
            .map(|i| {
                let kind = if i == 5 { "bad" } else { "ok" };
                Page::direct(i, format!("{}/{kind}/{i}.jpg", server.uri()))
            })
            .collect();

        let (tx, mut events) = mpsc::unbounded_channel();
        let signals = RunSignals::new(&CancellationToken::new(), tx);
        let mut rx = scheduler(3).dispatch(&pages, &signals);
        drop(signals);

        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            if result.page_index == 5 {
                assert!(matches!(result.outcome, Err(PageError::Fetch { .. })));
                assert_eq!(result.attempts, 1);
            } else {
                assert_eq!(result.outcome.unwrap().index, result.page_index);
            }
            seen.push(result.page_index);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());

        let mut terminal = 0;
        while let Ok(event) = events.try_recv() {
            terminal += usize::from(event.state.is_terminal());
        }
        assert_eq!(terminal, 12);
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(jpeg(64))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let pages: Vec<Page> = (0..4)
            .map(|i| Page::direct(i, format!("{}/{i}.jpg", server.uri())))
            .collect();
        let cancel = CancellationToken::new();
        let (tx, _events) = mpsc::unbounded_channel();
        let signals = RunSignals::new(&cancel, tx);
        let mut rx = scheduler(2).dispatch(&pages, &signals);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let mut cancelled = 0;
        while let Some(result) = rx.recv().await {
            if matches!(result.outcome, Err(PageError::Cancelled { .. })) {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 4);
    }
}
