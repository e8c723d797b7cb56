//! Run orchestration: manifest in, chunk PDFs out.
//!
//! [`Orchestrator::run`] validates the manifest, discovers the page count
//! when the manifest only carries a URL template, estimates page sizes,
//! plans chunks, and then drives the chunks one after another. Within a
//! chunk all pages are fetched concurrently on the shared pool while a
//! single event loop folds progress events, watches for stalls, and feeds
//! completed pages to the PDF writer in index order.
//!
//! Per-page failures never abort a chunk, and a failed chunk never rolls
//! back earlier ones. Only an invalid manifest, an impossible plan, or
//! cancellation stops the run early.

mod events;
mod ledger;
mod naming;

pub use events::HostEvent;
pub use ledger::{Ledger, LedgerEntry, LedgerError};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assembler::{AssembleError, ChunkArtifact, ChunkWriter, PdfAssembler, ReorderBuffer};
use crate::config::{DEFAULT_PER_PAGE_BYTE_ESTIMATE, RunSettings};
use crate::download::{ContentExpectation, FetchError, HttpClient, RateLimiter};
use crate::manifest::{Manifest, ManifestError, SourceRef};
use crate::planner::{Chunk, PlannerError, estimate_from_samples, plan};
use crate::progress::{ChunkStatus, ProgressEvent, ProgressMonitor, ProgressState, StuckLevel};
use crate::raster::PageImage;
use crate::scheduler::{
    Fetcher, JobState, PageResult, RunSignals, Scheduler, UrlTemplateProbe, discover_page_count,
    trim_trailing_artifacts,
};
use crate::tiles::TileStitcher;

use naming::{artifact_file_name, sanitize_stem};

/// Monitor ticks per idle window.
const TICKS_PER_WINDOW: u32 = 4;

/// Failure reason for a page whose job ended without a result.
const UNREPORTED: &str = "page job ended without reporting a result";

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("cannot plan chunks: {0}")]
    Planner(#[from] PlannerError),

    #[error("page-count discovery failed: {0}")]
    Discovery(#[source] FetchError),

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run cancelled after {} artifact(s)", .partial.artifacts.len())]
    Cancelled { partial: Box<RunReport> },
}

/// One page missing from the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page_index: usize,
    pub reason: String,
}

/// Best-effort result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub manifest_id: String,
    pub total_pages: usize,
    /// Chunk PDFs in plan order, including resumed ones.
    pub artifacts: Vec<PathBuf>,
    /// Sorted, deduplicated indices of pages absent from every artifact.
    pub failed_pages: Vec<usize>,
    pub failures: Vec<PageFailure>,
    pub failed_chunks: Vec<String>,
    pub resumed_chunks: usize,
}

impl RunReport {
    fn new(manifest_id: &str, total_pages: usize) -> Self {
        Self {
            manifest_id: manifest_id.to_string(),
            total_pages,
            ..Self::default()
        }
    }

    /// Whether every page made it into an artifact.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_pages.is_empty() && self.failed_chunks.is_empty()
    }

    fn record_failure(&mut self, page_index: usize, reason: String) {
        self.failures.push(PageFailure { page_index, reason });
    }

    fn finalize(&mut self) {
        self.failures.sort_by_key(|f| f.page_index);
        let mut failed: Vec<usize> = self.failures.iter().map(|f| f.page_index).collect();
        failed.dedup();
        self.failed_pages = failed;
    }
}

/// Drives whole runs against one output directory.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    client: HttpClient,
    output_dir: PathBuf,
    host_events: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(client: HttpClient, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            output_dir: output_dir.into(),
            host_events: None,
        }
    }

    /// Sends [`HostEvent`]s to `events` during runs.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        self.host_events = Some(events);
        self
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs `manifest` to completion or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] for an invalid manifest, a failed page-count
    /// discovery, an impossible plan, an unusable output directory, or
    /// cancellation. A cancelled run carries the artifacts already written.
    #[instrument(skip(self, manifest, settings, cancel), fields(manifest_id = %manifest.id))]
    pub async fn run(
        &self,
        manifest: Manifest,
        settings: &RunSettings,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        manifest.validate()?;

        let fetcher = Arc::new(Fetcher::new(
            self.client.clone(),
            settings.concurrency,
            Arc::new(RateLimiter::new(settings.request_delay)),
            settings.retry_policy(),
            settings.request_timeout,
        ));
        let stitcher = Arc::new(TileStitcher::new(
            Arc::clone(&fetcher),
            settings.probe_method,
            settings.min_tile_bytes,
            settings.tile_missing_fraction,
        ));
        let scheduler = Scheduler::new(Arc::clone(&fetcher), stitcher, settings.min_page_bytes);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let manifest = self
            .discover_pages(manifest, &fetcher, settings, &cancel, &progress_tx)
            .await?;
        let estimate = match settings.per_page_byte_estimate {
            Some(estimate) => estimate,
            None => {
                let signals = RunSignals::new(&cancel, progress_tx.clone());
                measure_page_bytes(&fetcher, &manifest, settings, &signals).await
            }
        };
        if cancel.is_cancelled() {
            return Err(cancelled(RunReport::new(&manifest.id, manifest.pages.len())));
        }

        let chunks = plan(manifest.pages.len(), estimate, settings.chunk_byte_ceiling)?;
        info!(
            pages = manifest.pages.len(),
            chunks = chunks.len(),
            per_page_estimate = estimate,
            "plan ready"
        );

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| RunError::OutputDir {
                path: self.output_dir.clone(),
                source,
            })?;

        let run = ChunkLoop {
            orchestrator: self,
            manifest: &manifest,
            scheduler,
            assembler: PdfAssembler::new(&self.output_dir),
            ledger: Ledger::load(&self.output_dir, &manifest.id),
            state: ProgressState::new(manifest.pages.len(), Instant::now()),
            monitor: ProgressMonitor::new(settings.stuck_idle_window),
            report: RunReport::new(&manifest.id, manifest.pages.len()),
            progress_tx,
            progress_rx,
            cancel,
        };
        run.drive(&chunks).await
    }

    async fn discover_pages(
        &self,
        manifest: Manifest,
        fetcher: &Arc<Fetcher>,
        settings: &RunSettings,
        cancel: &CancellationToken,
        progress_tx: &mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<Manifest, RunError> {
        let Some(discovery) = manifest.discovery.clone().filter(|_| manifest.needs_discovery())
        else {
            return Ok(manifest);
        };

        let probe = UrlTemplateProbe::new(
            Arc::clone(fetcher),
            discovery.clone(),
            settings.probe_method,
            ContentExpectation::image(settings.min_page_bytes),
            RunSignals::new(cancel, progress_tx.clone()),
        );
        let interrupted = |e: FetchError| {
            if e.is_cancelled() {
                cancelled(RunReport::new(&manifest.id, 0))
            } else {
                RunError::Discovery(e)
            }
        };

        let found = discover_page_count(&probe, discovery.max_pages)
            .await
            .map_err(interrupted)?;
        let tail_sample = u32::try_from(settings.tail_sample_size).unwrap_or(u32::MAX);
        let count = trim_trailing_artifacts(&probe, found.count, tail_sample, settings.tail_trim_ratio)
            .await
            .map_err(interrupted)?;
        info!(
            discovered = found.count,
            kept = count,
            probes = found.probes,
            "page count discovered"
        );
        Ok(manifest.with_discovered_pages(&discovery, count))
    }

    fn notify(&self, event: HostEvent) {
        if let Some(tx) = &self.host_events {
            let _ = tx.send(event);
        }
    }
}

fn cancelled(mut partial: RunReport) -> RunError {
    partial.finalize();
    RunError::Cancelled {
        partial: Box::new(partial),
    }
}

/// Averages sizes of the first, middle, and last page.
///
/// Direct pages are probed; tiled pages with known grids contribute their
/// raster size. Falls back to the global default when nothing is known.
#[allow(clippy::cast_precision_loss)]
async fn measure_page_bytes(
    fetcher: &Fetcher,
    manifest: &Manifest,
    settings: &RunSettings,
    signals: &RunSignals,
) -> f64 {
    let count = manifest.pages.len();
    let mut picks = vec![0, count / 2, count.saturating_sub(1)];
    picks.dedup();

    let expectation = ContentExpectation::image(settings.min_page_bytes);
    let mut samples = Vec::with_capacity(picks.len());
    for index in picks {
        let Some(page) = manifest.pages.get(index) else {
            continue;
        };
        match &page.source_ref {
            SourceRef::DirectImage { url } => {
                match fetcher
                    .probe(url, settings.probe_method, &expectation, signals)
                    .await
                {
                    Ok(outcome) if outcome.exists => samples.push(outcome.content_length),
                    Ok(_) => debug!(index, "sample page missing"),
                    Err(e) => debug!(index, error = %e, "sample probe failed"),
                }
            }
            SourceRef::TileGrid(grid) => {
                let raster = grid.grid_width.zip(grid.grid_height).map(|(w, h)| {
                    u64::from(w) * u64::from(h) * u64::from(grid.tile_size).pow(2) * 3
                });
                samples.push(raster);
            }
        }
    }

    estimate_from_samples(&samples).unwrap_or_else(|| {
        debug!("no usable samples; using default page estimate");
        DEFAULT_PER_PAGE_BYTE_ESTIMATE
    })
}

/// Per-run mutable state for the sequential chunk loop.
struct ChunkLoop<'a> {
    orchestrator: &'a Orchestrator,
    manifest: &'a Manifest,
    scheduler: Scheduler,
    assembler: PdfAssembler,
    ledger: Ledger,
    state: ProgressState,
    monitor: ProgressMonitor,
    report: RunReport,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    cancel: CancellationToken,
}

impl ChunkLoop<'_> {
    async fn drive(mut self, chunks: &[Chunk]) -> Result<RunReport, RunError> {
        let stem = sanitize_stem(&self.manifest.display_name);
        for (ordinal, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.resume(chunk) {
                continue;
            }
            let file_name = artifact_file_name(&stem, chunk, ordinal, chunks.len());
            self.orchestrator.notify(HostEvent::ChunkStarted {
                chunk_id: chunk.id.clone(),
                ordinal,
                total_chunks: chunks.len(),
                pages: chunk.range(),
            });
            self.run_chunk(chunk, &file_name).await;
        }

        self.report_progress();
        if self.cancel.is_cancelled() {
            info!(artifacts = self.report.artifacts.len(), "run cancelled");
            return Err(cancelled(self.report));
        }
        self.report.finalize();
        info!(
            artifacts = self.report.artifacts.len(),
            failed_pages = self.report.failed_pages.len(),
            resumed = self.report.resumed_chunks,
            "run finished"
        );
        Ok(self.report)
    }

    /// Reuses a chunk finished by an earlier run.
    fn resume(&mut self, chunk: &Chunk) -> bool {
        let Some(entry) = self.ledger.completed(&chunk.id) else {
            return false;
        };
        info!(chunk_id = %chunk.id, path = %entry.path.display(), "chunk already on disk");
        self.report.artifacts.push(entry.path.clone());
        self.report.resumed_chunks += 1;
        self.state.mark_pages(chunk.range(), JobState::Succeeded);
        self.state.set_chunk_status(&chunk.id, ChunkStatus::Skipped);
        self.orchestrator.notify(HostEvent::ChunkSkipped {
            chunk_id: chunk.id.clone(),
            path: entry.path.clone(),
        });
        true
    }

    #[instrument(skip(self, chunk), fields(chunk_id = %chunk.id, pages = ?chunk.range()))]
    async fn run_chunk(&mut self, chunk: &Chunk, file_name: &str) {
        let signals = RunSignals::new(&self.cancel, self.progress_tx.clone());
        self.state.touch(Instant::now());
        self.state
            .set_chunk_status(&chunk.id, ChunkStatus::Downloading);

        let pages = &self.manifest.pages[chunk.range()];
        let mut results = self.scheduler.dispatch(pages, &signals);
        let mut reorder = ReorderBuffer::new(chunk.range());
        let mut writer = self.assembler.begin(chunk, file_name);

        let tick_period = self.monitor.idle_window() / TICKS_PER_WINDOW;
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut escalated = false;
        let mut aborted = false;

        loop {
            tokio::select! {
                biased;
                Some(event) = self.progress_rx.recv() => {
                    self.state.apply(event, Instant::now());
                }
                result = results.recv() => {
                    let Some(result) = result else { break };
                    let ready = self.accept(result, &mut reorder);
                    if !ready.is_empty() {
                        writer = match embed_pages(writer, ready).await {
                            Ok(writer) => writer,
                            Err(e) => {
                                signals.abort_stalled();
                                self.fail_chunk(chunk, &e.to_string());
                                return;
                            }
                        };
                    }
                }
                _ = ticker.tick() => {
                    match self.monitor.stuck_level(&self.state, Instant::now()) {
                        StuckLevel::Active => escalated = false,
                        StuckLevel::Stuck if !escalated => {
                            escalated = true;
                            let extra_attempts = signals.escalate();
                            warn!(extra_attempts, "no progress within idle window; escalating");
                            self.orchestrator.notify(HostEvent::Escalated {
                                chunk_id: chunk.id.clone(),
                                extra_attempts,
                            });
                        }
                        StuckLevel::Abort if !aborted => {
                            aborted = true;
                            warn!("still no progress; abandoning outstanding pages");
                            signals.abort_stalled();
                            self.orchestrator.notify(HostEvent::Stalled {
                                chunk_id: chunk.id.clone(),
                            });
                        }
                        StuckLevel::Stuck | StuckLevel::Abort => {}
                    }
                    self.report_progress();
                }
            }
        }
        while let Ok(event) = self.progress_rx.try_recv() {
            self.state.apply(event, Instant::now());
        }

        if self.cancel.is_cancelled() {
            // The writer is dropped unwritten; no partial artifact remains.
            debug!("discarding in-flight chunk");
            return;
        }

        let (lost, ready) = settle_unreported(&mut self.report, &mut reorder);
        for page_index in lost {
            warn!(page_index, "page job ended without a result");
            self.orchestrator.notify(HostEvent::PageFailed {
                page_index,
                reason: UNREPORTED.to_string(),
            });
        }
        if !ready.is_empty() {
            writer = match embed_pages(writer, ready).await {
                Ok(writer) => writer,
                Err(e) => {
                    self.fail_chunk(chunk, &e.to_string());
                    return;
                }
            };
        }

        self.state.set_chunk_status(&chunk.id, ChunkStatus::Assembling);
        let finished = tokio::task::spawn_blocking(move || writer.finish())
            .await
            .map_err(|e| AssembleError::Task(e.to_string()))
            .and_then(|result| result);
        match finished {
            Ok(artifact) => self.complete_chunk(chunk, artifact),
            Err(e) => self.fail_chunk(chunk, &e.to_string()),
        }
        self.report_progress();
    }

    /// Records one page result and returns the pages now ready in order.
    fn accept(&mut self, result: PageResult, reorder: &mut ReorderBuffer) -> Vec<PageImage> {
        let PageResult {
            page_index,
            outcome,
            ..
        } = result;
        let image = match outcome {
            Ok(image) => Some(image),
            Err(e) => {
                if !e.is_cancelled() {
                    let reason = e.to_string();
                    self.orchestrator.notify(HostEvent::PageFailed {
                        page_index,
                        reason: reason.clone(),
                    });
                    self.report.record_failure(page_index, reason);
                }
                None
            }
        };
        reorder.insert(page_index, image);
        reorder
            .drain_ready()
            .into_iter()
            .filter_map(|(_, slot)| slot)
            .collect()
    }

    fn complete_chunk(&mut self, chunk: &Chunk, artifact: ChunkArtifact) {
        for (page_index, e) in &artifact.skipped {
            self.orchestrator.notify(HostEvent::PageFailed {
                page_index: *page_index,
                reason: e.to_string(),
            });
            self.report.record_failure(*page_index, e.to_string());
        }
        let failed_pages: Vec<usize> = chunk
            .range()
            .filter(|index| !artifact.embedded.contains(index))
            .collect();

        let entry = LedgerEntry {
            chunk_id: chunk.id.clone(),
            start: chunk.start,
            end: chunk.end,
            path: artifact.path.clone(),
            failed_pages,
        };
        if let Err(e) = self.ledger.record(entry) {
            warn!(error = %e, "could not update resume ledger");
        }

        self.state.set_chunk_status(&chunk.id, ChunkStatus::Completed);
        self.orchestrator.notify(HostEvent::ChunkCompleted {
            chunk_id: chunk.id.clone(),
            path: artifact.path.clone(),
            pages_embedded: artifact.embedded.len(),
            bytes_written: artifact.bytes_written,
        });
        self.report.artifacts.push(artifact.path);
    }

    fn fail_chunk(&mut self, chunk: &Chunk, reason: &str) {
        warn!(chunk_id = %chunk.id, reason, "chunk failed");
        let already: Vec<usize> = self.report.failures.iter().map(|f| f.page_index).collect();
        for page_index in chunk.range().filter(|i| !already.contains(i)) {
            self.report
                .record_failure(page_index, format!("chunk failed: {reason}"));
        }
        self.report.failed_chunks.push(chunk.id.clone());
        self.state.set_chunk_status(&chunk.id, ChunkStatus::Failed);
        self.orchestrator.notify(HostEvent::ChunkFailed {
            chunk_id: chunk.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn report_progress(&self) {
        let snapshot = self.monitor.snapshot(&self.state, Instant::now());
        self.orchestrator.notify(HostEvent::Progress(snapshot));
    }
}

/// Records pages whose job never reported a result as failed and returns
/// them with the pages they were holding back, in index order.
fn settle_unreported(
    report: &mut RunReport,
    reorder: &mut ReorderBuffer,
) -> (Vec<usize>, Vec<PageImage>) {
    let lost = reorder.close_gaps();
    for &page_index in &lost {
        report.record_failure(page_index, UNREPORTED.to_string());
    }
    let ready = reorder
        .drain_ready()
        .into_iter()
        .filter_map(|(_, slot)| slot)
        .collect();
    (lost, ready)
}

/// Embeds in-order pages on the blocking pool, handing the writer back.
async fn embed_pages(
    mut writer: ChunkWriter,
    pages: Vec<PageImage>,
) -> Result<ChunkWriter, AssembleError> {
    tokio::task::spawn_blocking(move || {
        for page in pages {
            writer.add_page(page);
        }
        writer
    })
    .await
    .map_err(|e| AssembleError::Task(e.to_string()))
}
