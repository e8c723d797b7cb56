//! Auto-split planner: partitions a document into byte-bounded chunks.
//!
//! Pages are walked in order while their estimated sizes accumulate. A chunk
//! closes as soon as the next page would push it past the ceiling; a single
//! page larger than the ceiling still gets a chunk of its own. The full plan
//! is computed once, before any fetching, so chunk ids are stable across runs.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

/// Hex characters kept from the range digest.
const CHUNK_ID_LEN: usize = 16;

/// Errors that abort a run before any fetch.
#[derive(Debug, Error, PartialEq)]
pub enum PlannerError {
    #[error("manifest has no pages to plan")]
    NoPages,

    #[error("per-page byte estimate must be a positive number, got {0}")]
    InvalidEstimate(f64),

    #[error("chunk byte ceiling must be a positive number, got {0}")]
    InvalidCeiling(f64),
}

/// A contiguous page range written to one PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Deterministic id derived from the range; see [`chunk_id`].
    pub id: String,
    /// First page index (inclusive).
    pub start: usize,
    /// One past the last page index.
    pub end: usize,
    pub estimated_bytes: f64,
}

impl Chunk {
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Stable identifier for the page range `[start, end)`.
///
/// ```
/// use folio_core::planner::chunk_id;
///
/// assert_eq!(chunk_id(0, 20), chunk_id(0, 20));
/// assert_ne!(chunk_id(0, 20), chunk_id(0, 21));
/// ```
#[must_use]
pub fn chunk_id(start: usize, end: usize) -> String {
    let digest = Sha256::digest(format!("{start}:{end}").as_bytes());
    let mut id: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    id.truncate(CHUNK_ID_LEN);
    id
}

/// Partitions `[0, total_pages)` into chunks bounded by `chunk_byte_ceiling`.
///
/// # Errors
///
/// Returns [`PlannerError`] for zero pages or a non-positive estimate or ceiling.
#[instrument]
pub fn plan(
    total_pages: usize,
    per_page_byte_estimate: f64,
    chunk_byte_ceiling: f64,
) -> Result<Vec<Chunk>, PlannerError> {
    if total_pages == 0 {
        return Err(PlannerError::NoPages);
    }
    if !(per_page_byte_estimate.is_finite() && per_page_byte_estimate > 0.0) {
        return Err(PlannerError::InvalidEstimate(per_page_byte_estimate));
    }
    if !(chunk_byte_ceiling.is_finite() && chunk_byte_ceiling > 0.0) {
        return Err(PlannerError::InvalidCeiling(chunk_byte_ceiling));
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut pages_in_chunk: u32 = 0;
    for page in 0..total_pages {
        let with_next = f64::from(pages_in_chunk + 1) * per_page_byte_estimate;
        if pages_in_chunk > 0 && with_next > chunk_byte_ceiling {
            chunks.push(make_chunk(start, page, per_page_byte_estimate));
            start = page;
            pages_in_chunk = 0;
        }
        pages_in_chunk += 1;
    }
    chunks.push(make_chunk(start, total_pages, per_page_byte_estimate));

    debug!(chunks = chunks.len(), "plan computed");
    Ok(chunks)
}

#[allow(clippy::cast_precision_loss)]
fn make_chunk(start: usize, end: usize, per_page: f64) -> Chunk {
    Chunk {
        id: chunk_id(start, end),
        start,
        end,
        estimated_bytes: (end - start) as f64 * per_page,
    }
}

/// Averages measured page sizes, ignoring unknown entries.
///
/// Returns `None` when nothing was measured.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate_from_samples(samples: &[Option<u64>]) -> Option<f64> {
    let known: Vec<u64> = samples.iter().flatten().copied().filter(|&n| n > 0).collect();
    if known.is_empty() {
        return None;
    }
    Some(known.iter().sum::<u64>() as f64 / known.len() as f64)
}
