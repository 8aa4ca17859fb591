use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::RasterError;

/// Temporary file removed on drop.
struct TempPath(PathBuf);

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn write_temp_pdf(pdf_bytes: &[u8]) -> Result<TempPath, RasterError> {
    let path = std::env::temp_dir().join(format!("pageflow_{}.pdf", uuid::Uuid::new_v4()));
    std::fs::write(&path, pdf_bytes)
        .map_err(|e| RasterError::PdfProcessing(format!("Failed to write temp PDF: {}", e)))?;
    Ok(TempPath(path))
}

/// Renders every page of a PDF to PNG, in page order.
pub(super) fn render_pages(pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, RasterError> {
    let _span = tracing::info_span!("raster.pdf").entered();

    let pdf = write_temp_pdf(pdf_bytes)?;
    let page_count = page_count(pdf_bytes, &pdf.0)?;
    if page_count == 0 {
        return Err(RasterError::PdfProcessing("PDF has no pages".to_string()));
    }

    (1..=page_count)
        .map(|page| render_page(&pdf.0, page, dpi))
        .collect()
}

/// Page count from lopdf, falling back to `pdfinfo` for files lopdf cannot
/// parse (e.g. broken cross-reference tables).
fn page_count(pdf_bytes: &[u8], pdf_path: &Path) -> Result<u32, RasterError> {
    match lopdf::Document::load_mem(pdf_bytes) {
        Ok(doc) => Ok(doc.get_pages().len() as u32),
        Err(e) => {
            tracing::warn!("lopdf failed to parse PDF: {}. Falling back to pdfinfo.", e);
            count_pages_with_pdfinfo(pdf_path)
        }
    }
}

fn count_pages_with_pdfinfo(pdf_path: &Path) -> Result<u32, RasterError> {
    let output = Command::new("pdfinfo").arg(pdf_path).output().map_err(|e| {
        RasterError::PdfProcessing(format!(
            "Failed to run pdfinfo: {}. Make sure poppler-utils is installed.",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(RasterError::PdfProcessing(format!(
            "pdfinfo failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    parse_pdfinfo_pages(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        RasterError::PdfProcessing("pdfinfo did not report a page count".to_string())
    })
}

fn parse_pdfinfo_pages(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse().ok())
}

fn render_page(pdf_path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, RasterError> {
    let output_prefix =
        std::env::temp_dir().join(format!("pageflow_page_{}", uuid::Uuid::new_v4()));
    let page_arg = page.to_string();

    let output = Command::new("pdftoppm")
        .arg("-png")
        .args(["-r", &dpi.to_string()])
        .args(["-f", &page_arg, "-l", &page_arg])
        .arg(pdf_path)
        .arg(&output_prefix)
        .output()
        .map_err(|e| {
            RasterError::PdfProcessing(format!(
                "Failed to run pdftoppm: {}. Make sure poppler-utils is installed.",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(RasterError::PdfProcessing(format!(
            "pdftoppm failed on page {}: {}",
            page,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    // pdftoppm zero-pads the page suffix depending on the document's page count
    let candidates = [
        format!("{}-{}.png", output_prefix.display(), page),
        format!("{}-{:02}.png", output_prefix.display(), page),
        format!("{}-{:03}.png", output_prefix.display(), page),
    ];
    let image_path = candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .map(TempPath)
        .ok_or_else(|| {
            RasterError::PdfProcessing(format!("Failed to find rendered image for page {}", page))
        })?;

    std::fs::read(&image_path.0).map_err(|e| {
        RasterError::PdfProcessing(format!("Failed to read rendered page {}: {}", page, e))
    })
}
