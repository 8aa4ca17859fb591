//! Turning a submitted document into ordered page images.
//!
//! Images are a single page. PDFs are rendered page by page with poppler.

mod image;
mod pdf;

use std::path::Path;

use crate::error::RasterError;
use crate::job::FileType;

/// A document split into page images, in page order.
#[derive(Debug, Clone)]
pub struct RasterizedDocument {
    pub filename: String,
    pub file_type: FileType,
    /// PNG bytes, one entry per page.
    pub pages: Vec<Vec<u8>>,
}

pub trait Rasterizer: Send + Sync {
    fn rasterize(&self, path: &Path) -> Result<RasterizedDocument, RasterError>;
}

/// Default rasterizer: decodes images with `image`, renders PDFs with
/// `pdftoppm` at the configured resolution.
#[derive(Debug, Clone)]
pub struct DocumentRasterizer {
    dpi: u32,
}

impl DocumentRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn rasterize_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<RasterizedDocument, RasterError> {
        let file_type = detect_file_type(filename, bytes)?;
        let pages = match file_type {
            FileType::Image => vec![image::normalize_to_png(bytes)?],
            FileType::Pdf => pdf::render_pages(bytes, self.dpi)?,
        };

        log::info!(
            "Rasterized {} ({}) into {} page(s)",
            filename,
            file_type,
            pages.len()
        );

        Ok(RasterizedDocument {
            filename: filename.to_string(),
            file_type,
            pages,
        })
    }
}

impl Rasterizer for DocumentRasterizer {
    fn rasterize(&self, path: &Path) -> Result<RasterizedDocument, RasterError> {
        let _span = tracing::info_span!("raster.document").entered();

        let bytes = std::fs::read(path).map_err(|e| RasterError::ReadDocument {
            path: path.to_path_buf(),
            source: e,
        })?;
        if bytes.is_empty() {
            return Err(RasterError::EmptyDocument(path.to_path_buf()));
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();

        self.rasterize_bytes(&filename, &bytes)
    }
}

/// Content sniffing first, then the file extension.
fn detect_file_type(filename: &str, bytes: &[u8]) -> Result<FileType, RasterError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(FileType::Pdf);
    }
    if ::image::guess_format(bytes).is_ok() {
        return Ok(FileType::Image);
    }

    let mime = mime_guess::from_path(filename).first_or_octet_stream();
    FileType::from_mime(mime.essence_str())
        .ok_or_else(|| RasterError::UnsupportedFormat(mime.essence_str().to_string()))
}
