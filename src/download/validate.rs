//! Content checks that separate real images from placeholders.
//!
//! Image services routinely answer 200 for things that are not content:
//! zero-byte phantom pages past the end of a document, tiny "no tile here"
//! placeholders, HTML error pages. These checks run on every fetched body and
//! on every probe response.

use crate::raster::{ImageKind, sniff_image_kind};

use super::FetchError;

/// What a response must look like to count as real content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentExpectation {
    /// Minimum payload size in bytes.
    pub min_bytes: u64,
    /// Expected media family prefix of the Content-Type (e.g. `"image/"`).
    pub media_family: String,
}

impl ContentExpectation {
    /// Expects an image of at least `min_bytes` bytes.
    #[must_use]
    pub fn image(min_bytes: u64) -> Self {
        Self {
            min_bytes,
            media_family: "image/".to_string(),
        }
    }

    /// Returns true if a Content-Type header value belongs to the expected family.
    ///
    /// `application/octet-stream` and a missing header are inconclusive and
    /// return `None`, leaving the decision to magic-byte sniffing.
    #[must_use]
    pub fn content_type_matches(&self, content_type: Option<&str>) -> Option<bool> {
        let value = content_type?.trim().to_ascii_lowercase();
        if value.is_empty() || value.starts_with("application/octet-stream") {
            return None;
        }
        Some(value.starts_with(&self.media_family))
    }

    /// Decides whether a probe response describes real content.
    ///
    /// `head` holds the first body bytes when the probe read any.
    #[must_use]
    pub fn accepts_probe(
        &self,
        content_length: Option<u64>,
        content_type: Option<&str>,
        head: &[u8],
    ) -> bool {
        let Some(length) = content_length else {
            return false;
        };
        if length < self.min_bytes || length == 0 {
            return false;
        }
        match self.content_type_matches(content_type) {
            Some(matches) => matches,
            None => sniff_image_kind(head).is_some(),
        }
    }
}

/// Validates a complete response body as an image.
///
/// # Errors
///
/// Returns [`FetchError::InvalidContent`] when the body is smaller than the
/// floor or does not start with a known image signature.
pub fn validate_image_body(
    url: &str,
    bytes: &[u8],
    expectation: &ContentExpectation,
) -> Result<ImageKind, FetchError> {
    let len = bytes.len() as u64;
    if len < expectation.min_bytes.max(1) {
        return Err(FetchError::invalid_content(
            url,
            format!(
                "{len} bytes is below the {} byte floor",
                expectation.min_bytes
            ),
        ));
    }
    sniff_image_kind(bytes)
        .ok_or_else(|| FetchError::invalid_content(url, "payload is not a recognized image"))
}
