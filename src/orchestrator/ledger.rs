//! Resume ledger: which chunks of a manifest already have artifacts.
//!
//! Stored as `<output>/.<manifest-id>.chunks.json`. Chunk ids are derived
//! from page ranges, so a re-plan with the same manifest and settings maps
//! onto the same entries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::naming::ledger_file_name;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One completed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub chunk_id: String,
    pub start: usize,
    pub end: usize,
    pub path: PathBuf,
    /// Pages of the chunk that are absent from the artifact.
    #[serde(default)]
    pub failed_pages: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub manifest_id: String,
    #[serde(default)]
    pub chunks: Vec<LedgerEntry>,
    #[serde(skip)]
    location: PathBuf,
}

impl Ledger {
    /// Loads the ledger for `manifest_id` from `output_dir`.
    ///
    /// A missing, unreadable, or foreign ledger yields an empty one; resume
    /// is best effort and never blocks a run.
    #[must_use]
    pub fn load(output_dir: &Path, manifest_id: &str) -> Self {
        let location = output_dir.join(ledger_file_name(manifest_id));
        let fresh = || Self {
            manifest_id: manifest_id.to_string(),
            chunks: Vec::new(),
            location: location.clone(),
        };

        let raw = match std::fs::read(&location) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return fresh(),
            Err(e) => {
                warn!(path = %location.display(), error = %e, "ignoring unreadable ledger");
                return fresh();
            }
        };
        match serde_json::from_slice::<Self>(&raw) {
            Ok(ledger) if ledger.manifest_id == manifest_id => {
                debug!(chunks = ledger.chunks.len(), "ledger loaded");
                Self {
                    location: location.clone(),
                    ..ledger
                }
            }
            Ok(_) => {
                warn!(path = %location.display(), "ledger belongs to another manifest");
                fresh()
            }
            Err(e) => {
                warn!(path = %location.display(), error = %e, "ignoring corrupt ledger");
                fresh()
            }
        }
    }

    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The entry for `chunk_id`, if every page made it in and the artifact
    /// is still on disk. Chunks with failed pages are fetched again.
    #[must_use]
    pub fn completed(&self, chunk_id: &str) -> Option<&LedgerEntry> {
        self.chunks
            .iter()
            .find(|entry| entry.chunk_id == chunk_id)
            .filter(|entry| entry.failed_pages.is_empty() && entry.path.is_file())
    }

    /// Records a finished chunk and persists the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the file cannot be written.
    pub fn record(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.chunks.retain(|existing| existing.chunk_id != entry.chunk_id);
        self.chunks.push(entry);
        self.save()
    }

    fn save(&self) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = self.location.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| LedgerError::io(&tmp, source))?;
        std::fs::rename(&tmp, &self.location)
            .map_err(|source| LedgerError::io(&self.location, source))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(dir: &Path, id: &str) -> LedgerEntry {
        let path = dir.join(format!("{id}.pdf"));
        std::fs::write(&path, b"%PDF-1.5").unwrap();
        LedgerEntry {
            chunk_id: id.to_string(),
            start: 0,
            end: 10,
            path,
            failed_pages: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path(), "ms-1");
        assert!(ledger.chunks.is_empty());

        ledger.record(entry(dir.path(), "aaaa")).unwrap();
        assert!(dir.path().join(".ms-1.chunks.json").is_file());

        let reloaded = Ledger::load(dir.path(), "ms-1");
        let found = reloaded.completed("aaaa").unwrap();
        assert_eq!((found.start, found.end), (0, 10));
    }

    #[test]
    fn test_chunk_with_failed_pages_is_not_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path(), "ms-1");
        let mut partial = entry(dir.path(), "dddd");
        partial.failed_pages = vec![3];
        ledger.record(partial).unwrap();

        let reloaded = Ledger::load(dir.path(), "ms-1");
        assert_eq!(reloaded.chunks[0].failed_pages, vec![3]);
        assert!(reloaded.completed("dddd").is_none());
    }

    #[test]
    fn test_missing_artifact_is_not_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path(), "ms-1");
        let recorded = entry(dir.path(), "bbbb");
        std::fs::remove_file(&recorded.path).unwrap();
        ledger.record(recorded).unwrap();
        assert!(ledger.completed("bbbb").is_none());
    }

    #[test]
    fn test_corrupt_or_foreign_ledger_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".ms-1.chunks.json"), b"{not json").unwrap();
        assert!(Ledger::load(dir.path(), "ms-1").chunks.is_empty());

        let mut other = Ledger::load(dir.path(), "ms-2");
        other.record(entry(dir.path(), "cccc")).unwrap();
        std::fs::copy(
            dir.path().join(".ms-2.chunks.json"),
            dir.path().join(".ms-1.chunks.json"),
        )
        .unwrap();
        assert!(Ledger::load(dir.path(), "ms-1").chunks.is_empty());
    }
}
