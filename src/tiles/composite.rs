//! Compositing fetched tiles into one page raster.
//!
//! CPU-bound; callers run it on the blocking pool.

use std::collections::HashMap;

use image::{Rgb, RgbImage};
use tracing::{debug, warn};

use super::TileAssemblyError;

/// Fill color for interior tiles that could not be fetched.
const MISSING_FILL: Rgb<u8> = Rgb([255, 255, 255]);

/// Geometry of a tile grid at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
    pub tile_size: u32,
    /// Pixels cropped from the right and bottom edges of the full canvas.
    pub overlap_px: u32,
}

/// Longest canvas side accepted, in pixels.
pub const MAX_CANVAS_SIDE: u32 = 65_535;

impl GridLayout {
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Pixel span of `cells` tiles, `None` past [`MAX_CANVAS_SIDE`].
    fn span(&self, cells: u32) -> Option<u32> {
        self.tile_size
            .checked_mul(cells)
            .filter(|&px| px <= MAX_CANVAS_SIDE)
    }

    /// Canvas size when every tile is present and full-sized.
    ///
    /// # Errors
    ///
    /// Returns [`TileAssemblyError::CanvasTooLarge`] when either side would
    /// exceed [`MAX_CANVAS_SIDE`].
    pub fn nominal_size(&self) -> Result<(u32, u32), TileAssemblyError> {
        let too_large = || TileAssemblyError::CanvasTooLarge {
            columns: self.columns,
            rows: self.rows,
            tile_size: self.tile_size,
        };
        let width = self.span(self.columns).ok_or_else(too_large)?;
        let height = self.span(self.rows).ok_or_else(too_large)?;
        Ok((
            width.saturating_sub(self.overlap_px),
            height.saturating_sub(self.overlap_px),
        ))
    }
}

/// Fails when more than `max_missing_fraction` of the grid is missing.
///
/// # Errors
///
/// Returns [`TileAssemblyError::TooManyMissing`] above the threshold.
#[allow(clippy::cast_precision_loss)]
pub fn check_missing(
    missing: usize,
    total: usize,
    max_missing_fraction: f64,
) -> Result<(), TileAssemblyError> {
    if total == 0 {
        return Err(TileAssemblyError::EmptyGrid);
    }
    if missing as f64 / total as f64 > max_missing_fraction {
        return Err(TileAssemblyError::TooManyMissing {
            missing,
            total,
            threshold: max_missing_fraction,
        });
    }
    Ok(())
}

/// Decodes and places tiles onto a canvas.
///
/// `tiles` maps `(column, row)` to encoded bytes. Undecodable tiles count as
/// missing. Trailing columns and rows with no tile at all are trimmed away,
/// and the right and bottom edges shrink to the real size of the last
/// tiles, which image servers often deliver narrower than `tile_size`.
/// Interior holes are filled white.
///
/// # Errors
///
/// Returns [`TileAssemblyError`] when too many tiles are missing or nothing
/// could be placed.
pub fn composite_tiles(
    layout: GridLayout,
    tiles: HashMap<(u32, u32), Vec<u8>>,
    max_missing_fraction: f64,
) -> Result<RgbImage, TileAssemblyError> {
    let full = layout.nominal_size()?;
    let mut decoded: HashMap<(u32, u32), RgbImage> = HashMap::with_capacity(tiles.len());
    for ((col, row), bytes) in tiles {
        if col >= layout.columns || row >= layout.rows {
            continue;
        }
        match image::load_from_memory(&bytes) {
            Ok(img) => {
                decoded.insert((col, row), img.to_rgb8());
            }
            Err(e) => warn!(col, row, error = %e, "undecodable tile treated as missing"),
        }
    }

    let total = layout.tile_count();
    check_missing(total - decoded.len(), total, max_missing_fraction)?;

    let columns = (0..layout.columns)
        .rev()
        .find(|&c| (0..layout.rows).any(|r| decoded.contains_key(&(c, r))))
        .map_or(0, |c| c + 1);
    let rows = (0..layout.rows)
        .rev()
        .find(|&r| (0..layout.columns).any(|c| decoded.contains_key(&(c, r))))
        .map_or(0, |r| r + 1);
    if columns == 0 || rows == 0 {
        return Err(TileAssemblyError::EmptyGrid);
    }

    // Overlap is cropped only on an axis that kept its last tile.
    // Spans below stay within `full`, so they cannot overflow.
    let mut width = if columns == layout.columns {
        full.0
    } else {
        columns * layout.tile_size
    };
    let mut height = if rows == layout.rows {
        full.1
    } else {
        rows * layout.tile_size
    };

    // Edge tiles narrower than tile_size shrink the canvas.
    let last_col_width = (0..rows)
        .filter_map(|r| decoded.get(&(columns - 1, r)))
        .map(|t| t.width().min(layout.tile_size))
        .max();
    if let Some(w) = last_col_width {
        width = width.min((columns - 1) * layout.tile_size + w);
    }
    let last_row_height = (0..columns)
        .filter_map(|c| decoded.get(&(c, rows - 1)))
        .map(|t| t.height().min(layout.tile_size))
        .max();
    if let Some(h) = last_row_height {
        height = height.min((rows - 1) * layout.tile_size + h);
    }

    debug!(
        columns,
        rows,
        width,
        height,
        placed = decoded.len(),
        "compositing tiles"
    );

    let mut canvas = RgbImage::from_pixel(width, height, MISSING_FILL);
    for ((col, row), tile) in &decoded {
        if *col >= columns || *row >= rows {
            continue;
        }
        let (x, y) = (col * layout.tile_size, row * layout.tile_size);
        place_tile(&mut canvas, tile, x, y, layout.tile_size);
    }
    Ok(canvas)
}

/// Copies a tile onto the canvas, clipped to the tile cell and the canvas.
fn place_tile(canvas: &mut RgbImage, tile: &RgbImage, x_offset: u32, y_offset: u32, cell: u32) {
    let width = tile.width().min(cell).min(canvas.width().saturating_sub(x_offset));
    let height = tile.height().min(cell).min(canvas.height().saturating_sub(y_offset));
    for y in 0..height {
        for x in 0..width {
            canvas.put_pixel(x_offset + x, y_offset + y, *tile.get_pixel(x, y));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn png_tile(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buffer = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn full_grid(columns: u32, rows: u32, size: u32) -> HashMap<(u32, u32), Vec<u8>> {
        let mut tiles = HashMap::new();
        for c in 0..columns {
            for r in 0..rows {
                tiles.insert((c, r), png_tile(size, size, [10, 20, 30]));
            }
        }
        tiles
    }

    fn layout(columns: u32, rows: u32, overlap_px: u32) -> GridLayout {
        GridLayout {
            columns,
            rows,
            tile_size: 16,
            overlap_px,
        }
    }

    #[test]
    fn test_full_grid_dimensions() {
        let canvas = composite_tiles(layout(3, 2, 0), full_grid(3, 2, 16), 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (48, 32));
        assert_eq!(*canvas.get_pixel(47, 31), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_overlap_is_cropped() {
        let canvas = composite_tiles(layout(3, 2, 4), full_grid(3, 2, 16), 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (44, 28));
    }

    #[test]
    fn test_trimmed_bottom_row_keeps_horizontal_overlap() {
        let mut tiles = full_grid(4, 4, 16);
        for c in 0..4 {
            tiles.remove(&(c, 3));
        }
        let canvas = composite_tiles(layout(4, 4, 4), tiles, 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (60, 48));
    }

    #[test]
    fn test_trimmed_last_column_keeps_vertical_overlap() {
        let mut tiles = full_grid(4, 4, 16);
        for r in 0..4 {
            tiles.remove(&(3, r));
        }
        let canvas = composite_tiles(layout(4, 4, 4), tiles, 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (48, 60));
    }

    #[test]
    fn test_oversized_grid_is_rejected_without_overflow() {
        let huge = GridLayout {
            columns: 70_000,
            rows: 2,
            tile_size: 70_000,
            overlap_px: 0,
        };
        assert!(matches!(
            huge.nominal_size(),
            Err(TileAssemblyError::CanvasTooLarge { columns: 70_000, .. })
        ));
        let mut tiles = HashMap::new();
        tiles.insert((0, 0), png_tile(16, 16, [1, 2, 3]));
        let result = composite_tiles(huge, tiles, 1.0);
        assert!(matches!(result, Err(TileAssemblyError::CanvasTooLarge { .. })));
    }

    #[test]
    fn test_missing_last_column_is_trimmed() {
        let mut tiles = full_grid(10, 10, 16);
        for r in 0..10 {
            tiles.remove(&(9, r));
        }
        let canvas = composite_tiles(layout(10, 10, 0), tiles, 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (9 * 16, 10 * 16));
    }

    #[test]
    fn test_interior_hole_filled_white() {
        let mut tiles = full_grid(3, 3, 16);
        tiles.remove(&(1, 1));
        let canvas = composite_tiles(layout(3, 3, 0), tiles, 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (48, 48));
        assert_eq!(*canvas.get_pixel(20, 20), MISSING_FILL);
    }

    #[test]
    fn test_narrow_edge_tiles_shrink_canvas() {
        let mut tiles = full_grid(2, 2, 16);
        tiles.insert((1, 0), png_tile(5, 16, [1, 2, 3]));
        tiles.insert((1, 1), png_tile(5, 9, [1, 2, 3]));
        tiles.insert((0, 1), png_tile(16, 9, [1, 2, 3]));
        let canvas = composite_tiles(layout(2, 2, 0), tiles, 0.25).unwrap();
        assert_eq!(canvas.dimensions(), (21, 25));
    }

    #[test]
    fn test_too_many_missing_fails() {
        let mut tiles = full_grid(5, 2, 16);
        for c in 0..4 {
            tiles.remove(&(c, 0));
        }
        let err = composite_tiles(layout(5, 2, 0), tiles, 0.25).unwrap_err();
        assert!(matches!(
            err,
            TileAssemblyError::TooManyMissing {
                missing: 4,
                total: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_undecodable_tile_counts_as_missing() {
        let mut tiles = full_grid(2, 2, 16);
        tiles.insert((0, 0), b"\xFF\xD8\xFFgarbage".to_vec());
        assert!(composite_tiles(layout(2, 2, 0), tiles, 0.2).is_err());
    }
}
