//! Tile stitching for pages served as zoomable tile grids.
//!
//! For one page, [`TileStitcher::stitch`]:
//! 1. picks the deepest zoom level whose top-left tile exists,
//! 2. determines the grid by probing along the first row and column until two
//!    consecutive misses (O(width + height) probes),
//! 3. fetches every tile through the run's shared pool,
//! 4. composites the tiles on the blocking pool.
//!
//! A page whose missing-tile fraction exceeds the configured threshold fails
//! with [`TileAssemblyError::TooManyMissing`]; below it, missing edge tiles are
//! trimmed and interior holes are filled.

mod composite;
mod template;

pub use composite::{GridLayout, MAX_CANVAS_SIDE, check_missing, composite_tiles};
pub use template::{has_zoom_placeholder, tile_url};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::{ContentExpectation, FetchError, ProbeMethod};
use crate::manifest::TileGridRef;
use crate::raster::PageImage;
use crate::scheduler::{Fetcher, ImageRequest, RunSignals};

/// Highest zoom level probed.
const MAX_ZOOM_PROBE: u32 = 20;

/// Largest grid extent probed along one axis.
const MAX_GRID_EXTENT: u32 = 512;

/// Consecutive misses that end an axis probe.
const AXIS_MISS_LIMIT: u32 = 2;

/// Errors that fail a tiled page.
#[derive(Debug, Error)]
pub enum TileAssemblyError {
    #[error("no zoom level responded for template {template}")]
    NoZoomLevel { template: String },

    #[error("tile grid is empty")]
    EmptyGrid,

    #[error("{columns}x{rows} grid of {tile_size}px tiles exceeds the canvas limit")]
    CanvasTooLarge {
        columns: u32,
        rows: u32,
        tile_size: u32,
    },

    #[error("{missing} of {total} tiles missing, above the {threshold} threshold")]
    TooManyMissing {
        missing: usize,
        total: usize,
        threshold: f64,
    },

    /// The run was cancelled or the chunk was abandoned as stalled.
    #[error("tile request interrupted: {0}")]
    Interrupted(#[source] FetchError),

    #[error("tile compositing task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Columns,
    Rows,
}

/// Discovers, fetches, and composites tile grids.
#[derive(Debug)]
pub struct TileStitcher {
    fetcher: Arc<Fetcher>,
    probe_method: ProbeMethod,
    tile_expectation: ContentExpectation,
    max_missing_fraction: f64,
}

impl TileStitcher {
    #[must_use]
    pub fn new(
        fetcher: Arc<Fetcher>,
        probe_method: ProbeMethod,
        min_tile_bytes: u64,
        max_missing_fraction: f64,
    ) -> Self {
        Self {
            fetcher,
            probe_method,
            tile_expectation: ContentExpectation::image(min_tile_bytes),
            max_missing_fraction,
        }
    }

    /// Produces the composited raster for one tiled page.
    ///
    /// # Errors
    ///
    /// Returns [`TileAssemblyError`] when no zoom level or grid can be found,
    /// too many tiles are missing, or the run is interrupted.
    #[instrument(skip(self, grid, signals), fields(template = %grid.base_url_template))]
    pub async fn stitch(
        &self,
        page_index: usize,
        grid: &TileGridRef,
        signals: &RunSignals,
    ) -> Result<PageImage, TileAssemblyError> {
        let zoom = self.resolve_zoom(grid, signals).await?;
        let layout = self.resolve_layout(grid, zoom, signals).await?;
        let tiles = self
            .fetch_tiles(page_index, grid, zoom, layout, signals)
            .await?;

        let fraction = self.max_missing_fraction;
        let canvas =
            tokio::task::spawn_blocking(move || composite_tiles(layout, tiles, fraction))
                .await
                .map_err(|e| TileAssemblyError::Task(e.to_string()))??;

        let (width, height) = canvas.dimensions();
        info!(page_index, zoom, width, height, "tiled page assembled");
        Ok(PageImage::rgb(page_index, width, height, canvas.into_raw()))
    }

    async fn resolve_zoom(
        &self,
        grid: &TileGridRef,
        signals: &RunSignals,
    ) -> Result<u32, TileAssemblyError> {
        if grid.max_zoom_discovered || !has_zoom_placeholder(&grid.base_url_template) {
            return Ok(grid.zoom_level.unwrap_or(0));
        }

        let mut deepest = None;
        for zoom in 0..=MAX_ZOOM_PROBE {
            let url = tile_url(&grid.base_url_template, zoom, 0, 0, &grid.format);
            if !self.tile_exists(&url, signals).await? {
                break;
            }
            deepest = Some(zoom);
        }

        match (deepest, grid.zoom_level) {
            (Some(zoom), _) => {
                debug!(zoom, "maximum zoom discovered");
                Ok(zoom)
            }
            (None, Some(zoom)) => {
                warn!(zoom, "zoom probing found nothing, using manifest zoom");
                Ok(zoom)
            }
            (None, None) => Err(TileAssemblyError::NoZoomLevel {
                template: grid.base_url_template.clone(),
            }),
        }
    }

    async fn resolve_layout(
        &self,
        grid: &TileGridRef,
        zoom: u32,
        signals: &RunSignals,
    ) -> Result<GridLayout, TileAssemblyError> {
        let same_zoom = grid.zoom_level.is_none_or(|z| z == zoom);
        let (columns, rows) = match (grid.grid_width, grid.grid_height) {
            (Some(w), Some(h)) if same_zoom && w > 0 && h > 0 => (w, h),
            _ => {
                let columns = self.probe_axis(grid, zoom, Axis::Columns, signals).await?;
                let rows = self.probe_axis(grid, zoom, Axis::Rows, signals).await?;
                debug!(columns, rows, "tile grid discovered");
                (columns, rows)
            }
        };
        if columns == 0 || rows == 0 {
            return Err(TileAssemblyError::EmptyGrid);
        }
        let layout = GridLayout {
            columns,
            rows,
            tile_size: grid.tile_size,
            overlap_px: grid.overlap_px,
        };
        layout.nominal_size()?;
        Ok(layout)
    }

    /// Walks one axis from the origin until two consecutive misses.
    async fn probe_axis(
        &self,
        grid: &TileGridRef,
        zoom: u32,
        axis: Axis,
        signals: &RunSignals,
    ) -> Result<u32, TileAssemblyError> {
        let mut extent = 0;
        let mut misses = 0;
        for i in 0..MAX_GRID_EXTENT {
            let (col, row) = match axis {
                Axis::Columns => (i, 0),
                Axis::Rows => (0, i),
            };
            let url = tile_url(&grid.base_url_template, zoom, col, row, &grid.format);
            if self.tile_exists(&url, signals).await? {
                extent = i + 1;
                misses = 0;
            } else {
                misses += 1;
                if misses >= AXIS_MISS_LIMIT {
                    break;
                }
            }
        }
        Ok(extent)
    }

    /// Probe errors other than interruption count as a miss.
    async fn tile_exists(&self, url: &str, signals: &RunSignals) -> Result<bool, TileAssemblyError> {
        match self
            .fetcher
            .probe(url, self.probe_method, &self.tile_expectation, signals)
            .await
        {
            Ok(outcome) => Ok(outcome.exists),
            Err(e @ (FetchError::Cancelled { .. } | FetchError::Stalled { .. })) => {
                Err(TileAssemblyError::Interrupted(e))
            }
            Err(e) => {
                debug!(url, error = %e, "tile probe failed, treating as missing");
                Ok(false)
            }
        }
    }

    async fn fetch_tiles(
        &self,
        page_index: usize,
        grid: &TileGridRef,
        zoom: u32,
        layout: GridLayout,
        signals: &RunSignals,
    ) -> Result<HashMap<(u32, u32), Vec<u8>>, TileAssemblyError> {
        let total = layout.tile_count();
        let expectation = &self.tile_expectation;
        let fetcher = &self.fetcher;

        let mut pending: FuturesUnordered<_> = (0..layout.rows)
            .flat_map(|row| (0..layout.columns).map(move |col| (col, row)))
            .map(|(col, row)| {
                let url = tile_url(&grid.base_url_template, zoom, col, row, &grid.format);
                async move {
                    let request = ImageRequest {
                        url: &url,
                        page_index,
                        expectation,
                        retry_invalid: true,
                    };
                    let result = fetcher.fetch_image(request, None, signals).await;
                    ((col, row), result)
                }
            })
            .collect();

        let mut tiles = HashMap::with_capacity(total);
        let mut missing = 0;
        while let Some((position, result)) = pending.next().await {
            match result {
                Ok((_, bytes)) => {
                    tiles.insert(position, bytes);
                }
                Err(e @ (FetchError::Cancelled { .. } | FetchError::Stalled { .. })) => {
                    return Err(TileAssemblyError::Interrupted(e));
                }
                Err(e) => {
                    missing += 1;
                    debug!(col = position.0, row = position.1, error = %e, "tile missing");
                    // Fail fast once the page cannot meet the threshold.
                    check_missing(missing, total, self.max_missing_fraction)?;
                }
            }
        }
        Ok(tiles)
    }
}
