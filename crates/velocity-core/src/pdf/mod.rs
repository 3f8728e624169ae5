//! PDF text extraction and structural repair.

pub mod extractor;
pub mod repair;

pub use extractor::{extract_text, normalize_text, ExtractError, ExtractedText};
pub use repair::{is_repairable, rebuild_xref, RepairError};
