//! Page image payloads and format sniffing.
//!
//! A fetched page travels from the scheduler to the assembler as a
//! [`PageImage`]. Whole-page downloads keep their encoded bytes untouched;
//! stitched tile grids arrive as a decoded RGB raster.

use std::fmt;

/// Image container formats recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Webp,
    Tiff,
    Bmp,
}

impl ImageKind {
    /// Maps to the `image` crate format used for decoding.
    #[must_use]
    pub fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
            Self::Gif => image::ImageFormat::Gif,
            Self::Webp => image::ImageFormat::WebP,
            Self::Tiff => image::ImageFormat::Tiff,
            Self::Bmp => image::ImageFormat::Bmp,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
        };
        write!(f, "{label}")
    }
}

/// Detects the image container from leading magic bytes.
#[must_use]
pub fn sniff_image_kind(bytes: &[u8]) -> Option<ImageKind> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageKind::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageKind::Png),
        [b'G', b'I', b'F', b'8', ..] => Some(ImageKind::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageKind::Webp),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some(ImageKind::Tiff),
        [b'B', b'M', ..] => Some(ImageKind::Bmp),
        _ => None,
    }
}

/// Pixel or encoded data for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// The bytes exactly as the server sent them.
    Encoded {
        /// Container format detected from magic bytes.
        kind: ImageKind,
        /// Raw response body.
        bytes: Vec<u8>,
    },
    /// A composited 8-bit RGB raster (tile-stitched pages).
    Rgb {
        width: u32,
        height: u32,
        /// Row-major RGB triples, `width * height * 3` bytes.
        pixels: Vec<u8>,
    },
}

/// One page ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Zero-based page index in the manifest.
    pub index: usize,
    pub payload: ImagePayload,
}

impl PageImage {
    /// Wraps an encoded response body.
    #[must_use]
    pub fn encoded(index: usize, kind: ImageKind, bytes: Vec<u8>) -> Self {
        Self {
            index,
            payload: ImagePayload::Encoded { kind, bytes },
        }
    }

    /// Wraps a composited RGB raster.
    #[must_use]
    pub fn rgb(index: usize, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            index,
            payload: ImagePayload::Rgb {
                width,
                height,
                pixels,
            },
        }
    }

    /// Bytes held resident by this page.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        match &self.payload {
            ImagePayload::Encoded { bytes, .. } => bytes.len(),
            ImagePayload::Rgb { pixels, .. } => pixels.len(),
        }
    }
}
