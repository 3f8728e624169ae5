//! Text extraction from PDF bytes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to parse PDF structure: {0}")]
    Parse(#[source] lopdf::Error),
}

/// Result of extracting text from a PDF.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
}

/// Extract text from in-memory PDF bytes.
///
/// Per-page extraction failures are tolerated (that page contributes
/// nothing); only a structurally unparseable document is an error.
pub fn extract_text(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(ExtractError::Parse)?;

    let mut pages: Vec<u32> = doc.get_pages().keys().cloned().collect();
    pages.sort();
    let page_count = pages.len();

    let mut full_text = String::new();
    for page_num in &pages {
        let page_text = doc.extract_text(&[*page_num]).unwrap_or_default();
        full_text.push_str(&page_text);
        if !page_text.ends_with('\n') && !page_text.is_empty() {
            full_text.push('\n');
        }
    }

    tracing::debug!(
        chars = full_text.len(),
        pages = page_count,
        "Extracted text from PDF"
    );

    Ok(ExtractedText {
        text: full_text,
        page_count,
    })
}

/// Unify line endings and trim outer whitespace.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}
