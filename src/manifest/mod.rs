//! Normalized description of one paginated document.
//!
//! A [`Manifest`] is produced once by a [`ManifestAdapter`](adapter::ManifestAdapter)
//! and stays immutable for the lifetime of a run. Every page points at either
//! a whole image or a zoomable tile grid.
//!
//! The JSON form uses camelCase keys:
//!
//! ```json
//! {
//!   "id": "ms-1021",
//!   "displayName": "Book of Hours",
//!   "sourceName": "example-library",
//!   "originalUrl": "https://library.example.org/ms/1021",
//!   "pages": [
//!     { "index": 0, "sourceRef": { "type": "directImage", "url": "https://img.example.org/1021/1.jpg" } },
//!     { "index": 1, "sourceRef": {
//!         "type": "tileGrid",
//!         "baseUrlTemplate": "https://tiles.example.org/1021/2/{z}/{x}_{y}.{format}",
//!         "tileSize": 256
//!     } }
//!   ]
//! }
//! ```

pub mod adapter;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tiles::MAX_CANVAS_SIDE;

/// Errors found while validating a manifest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest id is empty")]
    EmptyId,

    #[error("manifest has no pages and no page-count discovery descriptor")]
    NoPages,

    #[error("page indices must be 0..{expected} without gaps; found {found} at position {position}")]
    NonContiguousIndex {
        position: usize,
        found: usize,
        expected: usize,
    },

    #[error("page {index} appears more than once")]
    DuplicateIndex { index: usize },

    #[error("page {index} has an empty URL")]
    EmptyUrl { index: usize },

    #[error("page {index} has tile size 0")]
    ZeroTileSize { index: usize },

    #[error("page {index} tile grid is wider or taller than {max_side} pixels")]
    GridTooLarge { index: usize, max_side: u32 },

    #[error("discovery template must contain {{page}}: {template}")]
    DiscoveryTemplate { template: String },

    #[error("discovery maxPages must be at least 1")]
    DiscoveryLimit,
}

/// One document to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub display_name: String,
    /// Selects the source profile used for concurrency, timeouts, and limits.
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub pages: Vec<Page>,
    /// Present when the source cannot report its page count up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<PageDiscovery>,
}

/// One page of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Zero-based, order-significant.
    pub index: usize,
    pub source_ref: SourceRef,
}

/// Where a page's pixels come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceRef {
    DirectImage { url: String },
    TileGrid(TileGridRef),
}

/// A page served as a zoomable grid of tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileGridRef {
    /// URL template with `{z}`, `{x}`/`{col}`, `{y}`/`{row}` and `{format}`.
    pub base_url_template: String,
    /// Column count; probed when absent.
    #[serde(default)]
    pub grid_width: Option<u32>,
    /// Row count; probed when absent.
    #[serde(default)]
    pub grid_height: Option<u32>,
    pub tile_size: u32,
    #[serde(default)]
    pub zoom_level: Option<u32>,
    #[serde(default = "default_tile_format")]
    pub format: String,
    /// Pixels cropped from the right and bottom of the composited canvas.
    #[serde(default)]
    pub overlap_px: u32,
    /// Set once `zoom_level` is known to be the maximum available.
    #[serde(default)]
    pub max_zoom_discovered: bool,
}

impl TileGridRef {
    /// Whether the declared grid stays within [`MAX_CANVAS_SIDE`] on both axes.
    ///
    /// Unknown dimensions are probed later and checked then.
    #[must_use]
    pub fn fits_canvas(&self) -> bool {
        let fits = |cells: Option<u32>| {
            self.tile_size <= MAX_CANVAS_SIDE
                && cells.is_none_or(|n| {
                    self.tile_size
                        .checked_mul(n)
                        .is_some_and(|px| px <= MAX_CANVAS_SIDE)
                })
        };
        fits(self.grid_width) && fits(self.grid_height)
    }
}

fn default_tile_format() -> String {
    "jpg".to_string()
}

/// Page-count discovery descriptor: pages are `urlTemplate` with `{page}`
/// replaced by `firstPageNumber`, `firstPageNumber + 1`, ...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDiscovery {
    pub url_template: String,
    #[serde(default = "default_first_page")]
    pub first_page_number: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_first_page() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    10_000
}

impl PageDiscovery {
    /// URL of the page at 1-based `ordinal`.
    #[must_use]
    pub fn page_url(&self, ordinal: u32) -> String {
        let number = self.first_page_number + ordinal.saturating_sub(1);
        self.url_template.replace("{page}", &number.to_string())
    }
}

impl Page {
    #[must_use]
    pub fn direct(index: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            source_ref: SourceRef::DirectImage { url: url.into() },
        }
    }

    #[must_use]
    pub fn tiled(index: usize, grid: TileGridRef) -> Self {
        Self {
            index,
            source_ref: SourceRef::TileGrid(grid),
        }
    }
}

impl Manifest {
    /// Parses a manifest from JSON and validates it.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error wrapped in [`adapter::AdapterError`] on bad
    /// JSON, or the validation failure.
    pub fn from_json(bytes: &[u8]) -> Result<Self, adapter::AdapterError> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the structural invariants the scheduler and planner rely on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::EmptyId);
        }

        if let Some(discovery) = &self.discovery {
            if !discovery.url_template.contains("{page}") {
                return Err(ManifestError::DiscoveryTemplate {
                    template: discovery.url_template.clone(),
                });
            }
            if discovery.max_pages == 0 {
                return Err(ManifestError::DiscoveryLimit);
            }
        } else if self.pages.is_empty() {
            return Err(ManifestError::NoPages);
        }

        let mut seen = HashSet::with_capacity(self.pages.len());
        for (position, page) in self.pages.iter().enumerate() {
            if !seen.insert(page.index) {
                return Err(ManifestError::DuplicateIndex { index: page.index });
            }
            if page.index != position {
                return Err(ManifestError::NonContiguousIndex {
                    position,
                    found: page.index,
                    expected: self.pages.len(),
                });
            }
            match &page.source_ref {
                SourceRef::DirectImage { url } if url.trim().is_empty() => {
                    return Err(ManifestError::EmptyUrl { index: page.index });
                }
                SourceRef::TileGrid(grid) if grid.base_url_template.trim().is_empty() => {
                    return Err(ManifestError::EmptyUrl { index: page.index });
                }
                SourceRef::TileGrid(grid) if grid.tile_size == 0 => {
                    return Err(ManifestError::ZeroTileSize { index: page.index });
                }
                SourceRef::TileGrid(grid) if !grid.fits_canvas() => {
                    return Err(ManifestError::GridTooLarge {
                        index: page.index,
                        max_side: MAX_CANVAS_SIDE,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether page count must be discovered before planning.
    #[must_use]
    pub fn needs_discovery(&self) -> bool {
        self.pages.is_empty() && self.discovery.is_some()
    }

    /// Returns a copy whose pages are the first `count` discovered pages.
    #[must_use]
    pub fn with_discovered_pages(&self, discovery: &PageDiscovery, count: u32) -> Self {
        let pages = (1..=count)
            .enumerate()
            .map(|(index, ordinal)| Page::direct(index, discovery.page_url(ordinal)))
            .collect();
        Self {
            pages,
            ..self.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn direct_manifest(count: usize) -> Manifest {
        Manifest {
            id: "m1".to_string(),
            display_name: "Test".to_string(),
            source_name: "default".to_string(),
            original_url: String::new(),
            pages: (0..count)
                .map(|i| Page::direct(i, format!("https://img.example.org/{i}.jpg")))
                .collect(),
            discovery: None,
        }
    }

    #[test]
    fn test_parse_camel_case_json() {
        let json = br#"{
            "id": "ms-7",
            "displayName": "Codex",
            "sourceName": "lib",
            "originalUrl": "https://lib.example.org/ms-7",
            "pages": [
                {"index": 0, "sourceRef": {"type": "directImage", "url": "https://a/0.jpg"}},
                {"index": 1, "sourceRef": {"type": "tileGrid",
                    "baseUrlTemplate": "https://t/{z}/{x}_{y}.{format}",
                    "gridWidth": 4, "gridHeight": 6, "tileSize": 256}}
            ]
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.pages.len(), 2);
        match &manifest.pages[1].source_ref {
            SourceRef::TileGrid(grid) => {
                assert_eq!(grid.grid_width, Some(4));
                assert_eq!(grid.format, "jpg");
                assert_eq!(grid.overlap_px, 0);
                assert!(!grid.max_zoom_discovered);
            }
            other => panic!("expected tile grid, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_pages_rejected_without_discovery() {
        assert_eq!(direct_manifest(0).validate(), Err(ManifestError::NoPages));
    }

    #[test]
    fn test_zero_pages_allowed_with_discovery() {
        let mut manifest = direct_manifest(0);
        manifest.discovery = Some(PageDiscovery {
            url_template: "https://img.example.org/p{page}.jpg".to_string(),
            first_page_number: 1,
            max_pages: 500,
        });
        assert!(manifest.validate().is_ok());
        assert!(manifest.needs_discovery());
    }

    #[test]
    fn test_gap_in_indices_rejected() {
        let mut manifest = direct_manifest(3);
        manifest.pages[2].index = 5;
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::NonContiguousIndex { position: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let mut manifest = direct_manifest(3);
        manifest.pages[2].index = 1;
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::DuplicateIndex { index: 1 })
        );
    }

    #[test]
    fn test_tile_grid_beyond_canvas_limit_rejected() {
        let mut manifest = direct_manifest(1);
        let mut grid = TileGridRef {
            base_url_template: "https://t/{x}_{y}.jpg".to_string(),
            grid_width: Some(300_000),
            grid_height: Some(4),
            tile_size: 256,
            zoom_level: None,
            format: "jpg".to_string(),
            overlap_px: 0,
            max_zoom_discovered: true,
        };
        manifest.pages[0] = Page::tiled(0, grid.clone());
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::GridTooLarge {
                index: 0,
                max_side: MAX_CANVAS_SIDE
            })
        );

        grid.grid_width = None;
        manifest.pages[0] = Page::tiled(0, grid);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_discovered_pages_use_first_page_number() {
        let discovery = PageDiscovery {
            url_template: "https://img.example.org/p{page}.jpg".to_string(),
            first_page_number: 0,
            max_pages: 100,
        };
        let manifest = direct_manifest(0).with_discovered_pages(&discovery, 3);
        assert_eq!(manifest.pages.len(), 3);
        assert_eq!(
            manifest.pages[2].source_ref,
            SourceRef::DirectImage {
                url: "https://img.example.org/p2.jpg".to_string()
            }
        );
        assert!(manifest.validate().is_ok());
    }
}
