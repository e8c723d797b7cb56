//! Shared fixtures for integration tests: synthetic page images and
//! mock responders for paged and tiled image servers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use wiremock::{Request, Respond, ResponseTemplate};

/// A small solid-color PNG.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([70, 80, 90])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// A valid JPEG padded with comment segments to exactly `total_len` bytes.
///
/// JPEGs are embedded verbatim, so PDF size tracks the sum of page sizes.
pub fn padded_jpeg(total_len: usize) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([200, 30, 30])));
    let mut base = Vec::new();
    img.write_to(&mut Cursor::new(&mut base), ImageFormat::Jpeg)
        .expect("encode jpeg");
    assert!(total_len >= base.len() + 4, "target smaller than base image");

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&base[..2]); // SOI
    let mut remaining = total_len - base.len();
    while remaining > 0 {
        // Marker (2) + length (2) + payload; the length field counts itself.
        let segment = remaining.min(65_535 + 2);
        let segment = if remaining - segment > 0 && remaining - segment < 4 {
            segment - 4
        } else {
            segment
        };
        let payload = segment - 4;
        out.extend_from_slice(&[0xFF, 0xFE]);
        out.extend_from_slice(&u16::try_from(payload + 2).expect("segment fits").to_be_bytes());
        out.resize(out.len() + payload, b' ');
        remaining -= segment;
    }
    out.extend_from_slice(&base[2..]);
    assert_eq!(out.len(), total_len);
    out
}

/// Serves `/<prefix>/<n>.<ext>` for `1..=pages` and zero-byte 200s past the end.
pub struct PagedResponder {
    pub pages: u32,
    pub body: Vec<u8>,
    pub hits: Arc<AtomicUsize>,
}

impl PagedResponder {
    pub fn new(pages: u32, body: Vec<u8>) -> Self {
        Self {
            pages,
            body,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Respond for PagedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let number = request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|file| file.split('.').next())
            .and_then(|n| n.parse::<u32>().ok());
        match number {
            Some(n) if (1..=self.pages).contains(&n) => {
                ResponseTemplate::new(200).set_body_bytes(self.body.clone())
            }
            // Phantom page: success status, no content.
            _ => ResponseTemplate::new(200),
        }
    }
}

/// Serves `/tiles/<col>_<row>.png`, with some tiles missing or broken.
pub struct TileResponder {
    pub columns: u32,
    pub rows: u32,
    pub tile: Vec<u8>,
    /// Tiles answered with 404.
    pub missing: HashSet<(u32, u32)>,
    /// Tiles answered with 500.
    pub failing: HashSet<(u32, u32)>,
}

impl TileResponder {
    pub fn full(columns: u32, rows: u32, tile_size: u32) -> Self {
        Self {
            columns,
            rows,
            tile: png(tile_size, tile_size),
            missing: HashSet::new(),
            failing: HashSet::new(),
        }
    }
}

impl Respond for TileResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let cell = request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|file| file.strip_suffix(".png"))
            .and_then(|stem| stem.split_once('_'))
            .and_then(|(c, r)| Some((c.parse::<u32>().ok()?, r.parse::<u32>().ok()?)));
        match cell {
            Some(cell) if self.failing.contains(&cell) => ResponseTemplate::new(500),
            Some(cell) if self.missing.contains(&cell) => ResponseTemplate::new(404),
            Some((c, r)) if c < self.columns && r < self.rows => {
                ResponseTemplate::new(200).set_body_bytes(self.tile.clone())
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

/// Page sizes (width, height) of every page in a PDF, in order.
pub fn pdf_page_sizes(path: &std::path::Path) -> Vec<(i64, i64)> {
    let doc = lopdf::Document::load(path).expect("load pdf");
    doc.get_pages()
        .values()
        .map(|id| {
            let page = doc.get_dictionary(*id).expect("page dictionary");
            let media = page
                .get(b"MediaBox")
                .and_then(lopdf::Object::as_array)
                .expect("media box");
            (
                media[2].as_i64().expect("width"),
                media[3].as_i64().expect("height"),
            )
        })
        .collect()
}
