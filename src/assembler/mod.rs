//! Streaming PDF assembly, one chunk at a time.
//!
//! A [`ChunkWriter`] receives page images in index order, converts each one
//! into an image XObject, and drops the source buffer right away. Finishing
//! writes `<name>.pdf.part` and renames it into place, so a cancelled or
//! failed chunk never leaves a half-written artifact behind.

mod embed;
mod reorder;

pub use embed::{ColorSpace, EmbeddableImage, PdfEmbedError, StreamFilter, prepare_image};
pub use reorder::ReorderBuffer;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId, Stream, dictionary};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::planner::Chunk;
use crate::raster::PageImage;

const PDF_VERSION: &str = "1.5";
const PART_SUFFIX: &str = "part";

/// Failure to produce a chunk artifact.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("chunk {chunk_id}: no page could be embedded ({skipped} skipped)")]
    NoImages { chunk_id: String, skipped: usize },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write PDF {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("assembly task failed: {0}")]
    Task(String),
}

impl AssembleError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A finished chunk PDF.
#[derive(Debug)]
pub struct ChunkArtifact {
    pub chunk_id: String,
    pub path: PathBuf,
    /// Page indices embedded, in document order.
    pub embedded: Vec<usize>,
    pub skipped: Vec<(usize, PdfEmbedError)>,
    pub bytes_written: u64,
}

/// Builds output paths and starts chunk writers.
#[derive(Debug, Clone)]
pub struct PdfAssembler {
    output_dir: PathBuf,
}

impl PdfAssembler {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Starts an empty writer for `chunk`, targeting `<output_dir>/<file_name>`.
    #[must_use]
    pub fn begin(&self, chunk: &Chunk, file_name: &str) -> ChunkWriter {
        ChunkWriter::new(chunk.id.clone(), self.output_dir.join(file_name))
    }

    /// Assembles a whole chunk from already fetched images, in any order.
    ///
    /// Images outside the chunk range are ignored. Blocking; async callers
    /// should run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`AssembleError::NoImages`] when nothing could be embedded, or
    /// an I/O error from writing the file.
    #[instrument(skip(self, images), fields(chunk_id = %chunk.id))]
    pub fn assemble_chunk(
        &self,
        chunk: &Chunk,
        file_name: &str,
        images: Vec<PageImage>,
    ) -> Result<ChunkArtifact, AssembleError> {
        let mut reorder = ReorderBuffer::new(chunk.range());
        let mut writer = self.begin(chunk, file_name);
        let mut received = vec![false; chunk.len()];
        for image in images {
            if let Some(seen) = image
                .index
                .checked_sub(chunk.start)
                .and_then(|offset| received.get_mut(offset))
            {
                *seen = true;
            }
            reorder.insert(image.index, Some(image));
        }
        // Absent pages become gaps so later pages still flow.
        for (offset, seen) in received.iter().enumerate() {
            if !seen {
                reorder.insert(chunk.start + offset, None);
            }
        }
        for (_, slot) in reorder.drain_ready() {
            if let Some(image) = slot {
                writer.add_page(image);
            }
        }
        writer.finish()
    }
}

/// Incrementally builds one chunk PDF.
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_id: String,
    path: PathBuf,
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
    embedded: Vec<usize>,
    skipped: Vec<(usize, PdfEmbedError)>,
}

impl ChunkWriter {
    fn new(chunk_id: String, path: PathBuf) -> Self {
        let mut doc = Document::with_version(PDF_VERSION);
        let pages_id = doc.new_object_id();
        Self {
            chunk_id,
            path,
            doc,
            pages_id,
            kids: Vec::new(),
            embedded: Vec::new(),
            skipped: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.embedded.len()
    }

    /// Embeds one page as a full-page image sized to its pixel dimensions.
    ///
    /// Pages must arrive in index order. An image that fails to embed is
    /// recorded as skipped and does not fail the chunk.
    pub fn add_page(&mut self, image: PageImage) {
        let page_index = image.index;
        match prepare_image(image) {
            Ok(prepared) => match self.push_page(page_index, prepared) {
                Ok(()) => self.embedded.push(page_index),
                Err(e) => {
                    warn!(page_index, error = %e, "page content encoding failed");
                    self.skipped.push((page_index, e));
                }
            },
            Err(e) => {
                warn!(page_index, error = %e, "skipping page that cannot be embedded");
                self.skipped.push((page_index, e));
            }
        }
    }

    fn push_page(
        &mut self,
        page_index: usize,
        image: EmbeddableImage,
    ) -> Result<(), PdfEmbedError> {
        let width = i64::from(image.width);
        let height = i64::from(image.height);

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width.into(),
                        0.into(),
                        0.into(),
                        height.into(),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content.encode().map_err(|e| PdfEmbedError::Content {
            page_index,
            message: e.to_string(),
        })?;
        let image_stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => image.color_space.pdf_name(),
                "BitsPerComponent" => 8,
                "Filter" => image.filter.pdf_name(),
            },
            image.data,
        )
        .with_compression(false);
        let image_id = self.doc.add_object(image_stream);

        let content_id = self.doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    /// Writes the document and atomically moves it into place.
    ///
    /// # Errors
    ///
    /// Returns [`AssembleError::NoImages`] when no page was embedded, or an
    /// I/O error from writing.
    pub fn finish(mut self) -> Result<ChunkArtifact, AssembleError> {
        if self.embedded.is_empty() {
            return Err(AssembleError::NoImages {
                chunk_id: self.chunk_id,
                skipped: self.skipped.len(),
            });
        }

        let count = i64::try_from(self.kids.len()).unwrap_or(i64::MAX);
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => std::mem::take(&mut self.kids),
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AssembleError::io(parent, e))?;
        }
        let part_path = self.path.with_extension(format!("pdf.{PART_SUFFIX}"));
        let file = File::create(&part_path).map_err(|e| AssembleError::io(&part_path, e))?;
        let mut out = BufWriter::new(file);
        if let Err(e) = self.doc.save_to(&mut out) {
            discard_partial(&part_path);
            return Err(AssembleError::Write {
                path: part_path,
                message: e.to_string(),
            });
        }
        if let Err(e) = out.into_inner().map_err(std::io::IntoInnerError::into_error) {
            discard_partial(&part_path);
            return Err(AssembleError::io(&part_path, e));
        }
        std::fs::rename(&part_path, &self.path).map_err(|e| AssembleError::io(&self.path, e))?;

        let bytes_written = std::fs::metadata(&self.path)
            .map_err(|e| AssembleError::io(&self.path, e))?
            .len();
        info!(
            chunk_id = %self.chunk_id,
            path = %self.path.display(),
            pages = self.embedded.len(),
            skipped = self.skipped.len(),
            bytes_written,
            "chunk written"
        );
        Ok(ChunkArtifact {
            chunk_id: self.chunk_id,
            path: self.path,
            embedded: self.embedded,
            skipped: self.skipped,
            bytes_written,
        })
    }
}

fn discard_partial(part_path: &Path) {
    if let Err(e) = std::fs::remove_file(part_path) {
        debug!(path = %part_path.display(), error = %e, "could not remove partial file");
    }
}
