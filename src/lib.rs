//! Folio core library.
//!
//! Downloads paginated image sets (whole-page images or tiled deep-zoom
//! grids) and assembles them into memory-bounded PDF chunks.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`manifest`] - Manifest model, validation, and source adapters
//! - [`config`] - Per-source profiles and resolved run settings
//! - [`download`] - HTTP client, retry policy, politeness delays, validation
//! - [`scheduler`] - Bounded-concurrency page jobs and page-count discovery
//! - [`tiles`] - Zoom and grid discovery plus tile compositing
//! - [`progress`] - Progress aggregation and stuck detection
//! - [`planner`] - Byte-bounded chunk planning
//! - [`assembler`] - Streaming PDF writer
//! - [`orchestrator`] - End-to-end runs with resume support

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assembler;
pub mod config;
pub mod download;
pub mod manifest;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod raster;
pub mod scheduler;
pub mod tiles;
mod user_agent;

// Re-export commonly used types
pub use assembler::{AssembleError, ChunkArtifact, PdfAssembler, PdfEmbedError};
pub use config::{ConfigError, ProfileSet, RunSettings, SourceProfile};
pub use download::{FetchError, HttpClient, ProbeMethod, RetryPolicy};
pub use manifest::adapter::{AdapterError, AdapterRegistry, ManifestAdapter};
pub use manifest::{Manifest, ManifestError, Page, SourceRef, TileGridRef};
pub use orchestrator::{HostEvent, Orchestrator, PageFailure, RunError, RunReport};
pub use planner::{Chunk, PlannerError, plan};
pub use progress::{ProgressMonitor, ProgressSnapshot, ProgressState};
pub use raster::PageImage;
pub use scheduler::{PageError, PageResult, Scheduler};
pub use tiles::{TileAssemblyError, TileStitcher};
