//! Per-page text extraction.
//!
//! The page worker only sees [`ExtractorRegistry`]: it resolves a model to an
//! [`EngineSpec`] and the registry routes the image to the extractor that
//! serves that backend.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::models::{Backend, EngineSpec};

#[cfg(feature = "tesseract")]
mod tesseract;
mod vision;

#[cfg(feature = "tesseract")]
pub use tesseract::TesseractExtractor;
pub use vision::VisionExtractor;

/// Text extracted from one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
}

impl Extraction {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            text: text.into(),
            confidence,
        }
    }
}

pub trait PageExtractor: Send + Sync {
    /// The backend this extractor serves.
    fn backend(&self) -> Backend;

    fn extract(&self, image: &[u8], engine: &EngineSpec) -> Result<Extraction, ExtractionError>;
}

#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<Backend, Arc<dyn PageExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an extractor, replacing any previous one for its backend.
    pub fn register(&mut self, extractor: Arc<dyn PageExtractor>) {
        self.extractors.insert(extractor.backend(), extractor);
    }

    pub fn with(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.register(extractor);
        self
    }

    /// Builds the extractors available in this build from config.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let mut registry = Self::new();
        registry.register(Arc::new(VisionExtractor::new(config.vision.clone())?));

        #[cfg(feature = "tesseract")]
        registry.register(Arc::new(TesseractExtractor::new(
            config.tesseract.data_path.clone(),
        )));

        Ok(registry)
    }

    pub fn supports(&self, backend: Backend) -> bool {
        self.extractors.contains_key(&backend)
    }

    /// Backends with a registered extractor, in sorted order.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.extractors.keys().copied().collect();
        backends.sort();
        backends
    }

    pub fn extract(&self, image: &[u8], engine: &EngineSpec) -> Result<Extraction, ExtractionError> {
        let extractor = self
            .extractors
            .get(&engine.backend)
            .ok_or_else(|| ExtractionError::BackendUnavailable(engine.backend.to_string()))?;
        extractor.extract(image, engine)
    }
}
