//! Run progress aggregation and stuck detection.
//!
//! The scheduler's workers emit [`ProgressEvent`]s; the orchestrator folds
//! them into the run's [`ProgressState`] at a single point and asks a
//! [`ProgressMonitor`] for a [`ProgressSnapshot`] to forward to the host. The
//! monitor only classifies: it never retries or cancels anything itself.
//!
//! Time is always passed in explicitly so the arithmetic is testable without
//! sleeping.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::scheduler::JobState;

/// Width of the sliding window used for the transfer rate.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// One observation from a worker: bytes received and/or a job state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub page_index: usize,
    pub bytes_delta: u64,
    pub state: JobState,
}

impl ProgressEvent {
    /// Bytes received for an in-flight page.
    #[must_use]
    pub fn bytes(page_index: usize, bytes_delta: u64) -> Self {
        Self {
            page_index,
            bytes_delta,
            state: JobState::InFlight,
        }
    }

    /// A job state change with no payload.
    #[must_use]
    pub fn state(page_index: usize, state: JobState) -> Self {
        Self {
            page_index,
            bytes_delta: 0,
            state,
        }
    }
}

/// Lifecycle of a planned chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Assembling,
    Completed,
    /// Already completed by an earlier run.
    Skipped,
    Failed,
}

/// Aggregate progress of one run. Created at run start, dropped at run end.
#[derive(Debug, Clone)]
pub struct ProgressState {
    total_pages: usize,
    bytes_transferred: u64,
    started_at: Instant,
    last_activity: Instant,
    page_status: BTreeMap<usize, JobState>,
    chunk_status: BTreeMap<String, ChunkStatus>,
    /// Terminal pages whose bytes were fetched in this run.
    fetched_pages: usize,
    rate_samples: VecDeque<(Instant, u64)>,
}

impl ProgressState {
    #[must_use]
    pub fn new(total_pages: usize, now: Instant) -> Self {
        Self {
            total_pages,
            bytes_transferred: 0,
            started_at: now,
            last_activity: now,
            page_status: BTreeMap::new(),
            chunk_status: BTreeMap::new(),
            fetched_pages: 0,
            rate_samples: VecDeque::new(),
        }
    }

    /// Folds one worker event into the state. Any event counts as activity.
    pub fn apply(&mut self, event: ProgressEvent, now: Instant) {
        self.last_activity = now;
        if event.bytes_delta > 0 {
            self.bytes_transferred += event.bytes_delta;
            self.rate_samples.push_back((now, event.bytes_delta));
        }
        while self
            .rate_samples
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > RATE_WINDOW)
        {
            self.rate_samples.pop_front();
        }

        let current = self.page_status.get(&event.page_index).copied();
        if current.is_some_and(JobState::is_terminal) || current == Some(event.state) {
            return;
        }
        self.page_status.insert(event.page_index, event.state);
        if event.state.is_terminal() {
            self.fetched_pages += 1;
        }
    }

    /// Marks pages resolved without fetching (resumed chunks).
    pub fn mark_pages(&mut self, pages: std::ops::Range<usize>, state: JobState) {
        for index in pages {
            self.page_status.insert(index, state);
        }
    }

    pub fn set_chunk_status(&mut self, chunk_id: &str, status: ChunkStatus) {
        self.chunk_status.insert(chunk_id.to_string(), status);
    }

    /// Resets the idle clock, e.g. when a new chunk starts.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[must_use]
    pub fn page_status(&self, page_index: usize) -> Option<JobState> {
        self.page_status.get(&page_index).copied()
    }

    #[must_use]
    pub fn chunk_status(&self, chunk_id: &str) -> Option<ChunkStatus> {
        self.chunk_status.get(chunk_id).copied()
    }

    /// Pages in a terminal state, fetched or resumed.
    #[must_use]
    pub fn finished_pages(&self) -> usize {
        self.page_status.values().filter(|s| s.is_terminal()).count()
    }

    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.started_at)
    }
}

/// How long a run has gone without any observed activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StuckLevel {
    Active,
    /// One idle window elapsed: escalate retries.
    Stuck,
    /// Two idle windows elapsed: abandon the outstanding jobs.
    Abort,
}

/// What the host sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// 0.0 to 100.0, by finished pages.
    pub percent: f64,
    pub bytes_per_second: f64,
    /// `None` until there is enough data to extrapolate.
    pub eta_seconds: Option<u64>,
    pub stuck: bool,
    pub bytes_transferred: u64,
    pub finished_pages: usize,
    pub total_pages: usize,
}

/// Classifies a [`ProgressState`] into host-facing numbers.
#[derive(Debug, Clone, Copy)]
pub struct ProgressMonitor {
    idle_window: Duration,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new(idle_window: Duration) -> Self {
        Self { idle_window }
    }

    #[must_use]
    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    #[must_use]
    pub fn stuck_level(&self, state: &ProgressState, now: Instant) -> StuckLevel {
        let idle = now.saturating_duration_since(state.last_activity);
        if idle >= self.idle_window * 2 {
            StuckLevel::Abort
        } else if idle >= self.idle_window {
            StuckLevel::Stuck
        } else {
            StuckLevel::Active
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn snapshot(&self, state: &ProgressState, now: Instant) -> ProgressSnapshot {
        let finished = state.finished_pages();
        let percent = if state.total_pages == 0 {
            100.0
        } else {
            (finished as f64 / state.total_pages as f64 * 100.0).min(100.0)
        };

        let window_bytes: u64 = state.rate_samples.iter().map(|(_, n)| n).sum();
        let window = state.elapsed(now).min(RATE_WINDOW).as_secs_f64();
        let bytes_per_second = if window > 0.0 {
            window_bytes as f64 / window
        } else {
            0.0
        };

        let remaining = state.total_pages.saturating_sub(finished);
        let eta_seconds = if remaining == 0 {
            Some(0)
        } else if state.fetched_pages > 0 && bytes_per_second > 0.0 {
            let per_page = state.bytes_transferred as f64 / state.fetched_pages as f64;
            Some((per_page * remaining as f64 / bytes_per_second).ceil() as u64)
        } else {
            None
        };

        ProgressSnapshot {
            percent,
            bytes_per_second,
            eta_seconds,
            stuck: self.stuck_level(state, now) != StuckLevel::Active,
            bytes_transferred: state.bytes_transferred,
            finished_pages: finished,
            total_pages: state.total_pages,
        }
    }
}
