//! Collaborator stubs.

#![allow(dead_code)]

use pageflow::extract::{Extraction, PageExtractor};
use pageflow::{Backend, EngineSpec, ExtractionError};

/// Treats page "images" as UTF-8 text. Pages starting with `FAIL` fail the
/// way an unreachable extraction service would.
pub struct TextExtractor;

pub const FAILURE_REASON: &str = "simulated service outage";

impl PageExtractor for TextExtractor {
    fn backend(&self) -> Backend {
        Backend::Vision
    }

    fn extract(&self, image: &[u8], _engine: &EngineSpec) -> Result<Extraction, ExtractionError> {
        if image.starts_with(b"FAIL") {
            return Err(ExtractionError::Request(FAILURE_REASON.to_string()));
        }
        Ok(Extraction::new(String::from_utf8_lossy(image).into_owned(), 0.9))
    }
}

/// Page bodies for a document, one entry per page.
pub fn pages(texts: &[&str]) -> Vec<Vec<u8>> {
    texts.iter().map(|t| t.as_bytes().to_vec()).collect()
}
