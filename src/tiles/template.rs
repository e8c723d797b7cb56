//! Tile URL templates.
//!
//! Recognized placeholders: `{z}`, `{x}` or `{col}`, `{y}` or `{row}`, and
//! `{format}`.

/// Builds the URL of one tile.
///
/// ```
/// use folio_core::tiles::tile_url;
///
/// let url = tile_url("https://t.example.org/{z}/{col}_{row}.{format}", 5, 3, 1, "jpg");
/// assert_eq!(url, "https://t.example.org/5/3_1.jpg");
/// ```
#[must_use]
pub fn tile_url(template: &str, zoom: u32, col: u32, row: u32, format: &str) -> String {
    let col = col.to_string();
    let row = row.to_string();
    template
        .replace("{z}", &zoom.to_string())
        .replace("{x}", &col)
        .replace("{col}", &col)
        .replace("{y}", &row)
        .replace("{row}", &row)
        .replace("{format}", format)
}

/// Whether the template varies by zoom level at all.
#[must_use]
pub fn has_zoom_placeholder(template: &str) -> bool {
    template.contains("{z}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xy_aliases() {
        assert_eq!(
            tile_url("https://t/{z}/{x}/{y}.{format}", 0, 10, 20, "png"),
            "https://t/0/10/20.png"
        );
    }

    #[test]
    fn test_zoom_placeholder_detection() {
        assert!(has_zoom_placeholder("https://t/{z}/{x}_{y}.jpg"));
        assert!(!has_zoom_placeholder("https://t/full/{x}_{y}.jpg"));
    }
}
