use std::io::Cursor;

use super::{Extraction, PageExtractor};
use crate::error::ExtractionError;
use crate::models::{Backend, EngineSpec};

/// Local OCR. The engine identifier is the Tesseract language string
/// (`eng`, `eng+deu`, ...).
#[derive(Debug, Clone, Default)]
pub struct TesseractExtractor {
    data_path: Option<String>,
}

impl TesseractExtractor {
    pub fn new(data_path: Option<String>) -> Self {
        Self { data_path }
    }
}

impl PageExtractor for TesseractExtractor {
    fn backend(&self) -> Backend {
        Backend::Tesseract
    }

    fn extract(&self, image: &[u8], engine: &EngineSpec) -> Result<Extraction, ExtractionError> {
        let _span = tracing::info_span!("extract.tesseract", languages = %engine.engine).entered();

        let img = image::load_from_memory(image)
            .map_err(|e| ExtractionError::InvalidImage(e.to_string()))?;

        // Convert to PNG in memory for leptess
        let mut png_data = Vec::new();
        img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)
            .map_err(|e| ExtractionError::InvalidImage(format!("Failed to convert image: {}", e)))?;

        let mut lt = leptess::LepTess::new(self.data_path.as_deref(), &engine.engine)
            .map_err(|e| {
                ExtractionError::OcrFailed(format!("Failed to initialize Tesseract: {}", e))
            })?;

        lt.set_image_from_mem(&png_data)
            .map_err(|e| ExtractionError::OcrFailed(format!("Failed to set image for OCR: {}", e)))?;

        let text = lt
            .get_utf8_text()
            .map_err(|e| ExtractionError::OcrFailed(e.to_string()))?;
        let confidence = f64::from(lt.mean_text_conf()) / 100.0;

        Ok(Extraction::new(text.trim_end(), confidence))
    }
}
