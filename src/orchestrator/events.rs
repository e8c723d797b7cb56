//! Notifications sent to the host while a run progresses.

use std::ops::Range;
use std::path::PathBuf;

use crate::progress::ProgressSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Periodic progress numbers, at least once per monitor tick.
    Progress(ProgressSnapshot),
    ChunkStarted {
        chunk_id: String,
        /// Zero-based position in the plan.
        ordinal: usize,
        total_chunks: usize,
        pages: Range<usize>,
    },
    /// Already on disk from an earlier run.
    ChunkSkipped { chunk_id: String, path: PathBuf },
    ChunkCompleted {
        chunk_id: String,
        path: PathBuf,
        pages_embedded: usize,
        bytes_written: u64,
    },
    ChunkFailed { chunk_id: String, reason: String },
    PageFailed { page_index: usize, reason: String },
    /// The run went idle; outstanding jobs were granted an extra attempt.
    Escalated { chunk_id: String, extra_attempts: u32 },
    /// The chunk stayed idle for a second window; outstanding jobs were abandoned.
    Stalled { chunk_id: String },
}
