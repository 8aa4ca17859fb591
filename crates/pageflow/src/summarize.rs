//! Merging ordered page results into the final document.

use crate::db::page_result_repo::PageResult;
use crate::error::SummarizeError;

/// Overview and markdown body of a finished document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub document_overview: String,
    pub markdown_content: String,
}

pub trait Summarizer: Send + Sync {
    /// `pages` are in ascending page order.
    fn summarize(&self, pages: &[PageResult], model: &str) -> Result<Summary, SummarizeError>;
}

/// Concatenates page texts under per-page headings.
#[derive(Debug, Clone)]
pub struct PageMergeSummarizer {
    max_content_chars: usize,
}

impl Default for PageMergeSummarizer {
    fn default() -> Self {
        Self::new(50_000)
    }
}

impl PageMergeSummarizer {
    pub fn new(max_content_chars: usize) -> Self {
        Self { max_content_chars }
    }
}

impl Summarizer for PageMergeSummarizer {
    fn summarize(&self, pages: &[PageResult], model: &str) -> Result<Summary, SummarizeError> {
        if pages.is_empty() {
            return Err(SummarizeError::NoPages);
        }

        let combined = pages
            .iter()
            .map(|p| format!("### Page {}\n{}", p.page_number, p.extracted_text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let document_overview = format!(
            "Document processed with {}. Contains {} pages.",
            model,
            pages.len()
        );

        let markdown_content = format!(
            "## Summary\n{}\n\n---\n\n## Extracted Texts\n{}",
            document_overview,
            truncate_chars(&combined, self.max_content_chars)
        );

        Ok(Summary {
            document_overview,
            markdown_content,
        })
    }
}

/// Keeps the first `max` characters, marking the cut with `...`.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
