//! Converting page images into PDF image XObject payloads.
//!
//! Baseline JPEGs in gray or RGB pass through untouched with `DCTDecode`.
//! Everything else is decoded and stored as 8-bit samples under
//! `FlateDecode`.

use std::io::{Cursor, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::codecs::jpeg::JpegDecoder;
use image::{DynamicImage, ExtendedColorType, ImageDecoder};
use thiserror::Error;

use crate::raster::{ImageKind, ImagePayload, PageImage};

/// A single page image that could not be embedded. The page is skipped.
#[derive(Debug, Error)]
pub enum PdfEmbedError {
    #[error("page {page_index}: cannot decode {kind} image: {source}")]
    Decode {
        page_index: usize,
        kind: ImageKind,
        #[source]
        source: image::ImageError,
    },

    #[error("page {page_index}: raster holds {actual} bytes, expected {expected}")]
    RasterSize {
        page_index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("page {page_index}: image has zero width or height")]
    Empty { page_index: usize },

    #[error("page {page_index}: cannot encode page content: {message}")]
    Content { page_index: usize, message: String },

    #[error("page {page_index}: compression failed: {source}")]
    Compress {
        page_index: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    DeviceGray,
    DeviceRgb,
}

impl ColorSpace {
    #[must_use]
    pub fn pdf_name(self) -> &'static str {
        match self {
            Self::DeviceGray => "DeviceGray",
            Self::DeviceRgb => "DeviceRGB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFilter {
    Dct,
    Flate,
}

impl StreamFilter {
    #[must_use]
    pub fn pdf_name(self) -> &'static str {
        match self {
            Self::Dct => "DCTDecode",
            Self::Flate => "FlateDecode",
        }
    }
}

/// Image data in the shape a PDF image stream needs.
#[derive(Debug)]
pub struct EmbeddableImage {
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub filter: StreamFilter,
    pub data: Vec<u8>,
}

/// Prepares one page for embedding, consuming its buffer.
///
/// # Errors
///
/// Returns [`PdfEmbedError`] when the image cannot be decoded or its raster
/// is inconsistent.
pub fn prepare_image(image: PageImage) -> Result<EmbeddableImage, PdfEmbedError> {
    let page_index = image.index;
    let prepared = match image.payload {
        ImagePayload::Encoded {
            kind: ImageKind::Jpeg,
            bytes,
        } => prepare_jpeg(page_index, bytes)?,
        ImagePayload::Encoded { kind, bytes } => {
            let decoded = image::load_from_memory_with_format(&bytes, kind.image_format())
                .map_err(|source| PdfEmbedError::Decode {
                    page_index,
                    kind,
                    source,
                })?;
            drop(bytes);
            flate_decoded(page_index, &decoded)?
        }
        ImagePayload::Rgb {
            width,
            height,
            pixels,
        } => {
            let expected = width as usize * height as usize * 3;
            if pixels.len() != expected {
                return Err(PdfEmbedError::RasterSize {
                    page_index,
                    expected,
                    actual: pixels.len(),
                });
            }
            EmbeddableImage {
                width,
                height,
                color_space: ColorSpace::DeviceRgb,
                filter: StreamFilter::Flate,
                data: deflate(page_index, &pixels)?,
            }
        }
    };

    if prepared.width == 0 || prepared.height == 0 {
        return Err(PdfEmbedError::Empty { page_index });
    }
    Ok(prepared)
}

fn prepare_jpeg(page_index: usize, bytes: Vec<u8>) -> Result<EmbeddableImage, PdfEmbedError> {
    let decode_error = |source| PdfEmbedError::Decode {
        page_index,
        kind: ImageKind::Jpeg,
        source,
    };
    let decoder = JpegDecoder::new(Cursor::new(&bytes)).map_err(decode_error)?;
    let (width, height) = decoder.dimensions();
    let original = decoder.original_color_type();
    // Full decode catches truncated scans that the header alone would pass.
    let decoded = DynamicImage::from_decoder(decoder).map_err(decode_error)?;

    let color_space = match original {
        ExtendedColorType::L8 => ColorSpace::DeviceGray,
        ExtendedColorType::Rgb8 => ColorSpace::DeviceRgb,
        _ => return flate_decoded(page_index, &decoded),
    };
    Ok(EmbeddableImage {
        width,
        height,
        color_space,
        filter: StreamFilter::Dct,
        data: bytes,
    })
}

fn flate_decoded(
    page_index: usize,
    decoded: &DynamicImage,
) -> Result<EmbeddableImage, PdfEmbedError> {
    let (color_space, samples) = if decoded.color().has_color() {
        (ColorSpace::DeviceRgb, decoded.to_rgb8().into_raw())
    } else {
        (ColorSpace::DeviceGray, decoded.to_luma8().into_raw())
    };
    Ok(EmbeddableImage {
        width: decoded.width(),
        height: decoded.height(),
        color_space,
        filter: StreamFilter::Flate,
        data: deflate(page_index, &samples)?,
    })
}

fn deflate(page_index: usize, samples: &[u8]) -> Result<Vec<u8>, PdfEmbedError> {
    let compress_error = |source| PdfEmbedError::Compress { page_index, source };
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(samples.len() / 4), Compression::default());
    encoder.write_all(samples).map_err(compress_error)?;
    encoder.finish().map_err(compress_error)
}
