//! Structural repair for PDFs with a malformed cross-reference table.
//!
//! Strategy: scan the raw bytes for top-level `N G obj` headers, rebuild a
//! complete xref table from their offsets, and append it with a fresh
//! trailer as an incremental update. Readers follow the final `startxref`,
//! so the damaged table is never consulted again. Object bytes are left
//! untouched, which keeps the repair safe to apply to any payload.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::bytes::Regex;
use thiserror::Error;

use super::extractor::ExtractError;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("no PDF objects found in payload")]
    NoObjects,
    #[error("no document catalog found; cannot rebuild trailer")]
    MissingCatalog,
}

/// Whether an extraction failure falls into the malformed cross-reference
/// class the repair tool handles. Anything else (garbage bytes, encrypted
/// content, missing pages) is not repairable by rewriting the xref.
pub fn is_repairable(error: &ExtractError) -> bool {
    let ExtractError::Parse(inner) = error;
    // The signature check covers both the rendered message and the variant
    // name, since lopdf wording differs across versions.
    let signature = format!("{inner} {inner:?}").to_ascii_lowercase();
    ["xref", "cross-reference", "cross reference", "trailer", "offset"]
        .iter()
        .any(|needle| signature.contains(needle))
}

fn object_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?-u)(?:^|[^0-9])(\d{1,10})[ \t]+(\d{1,5})[ \t]+obj\b").unwrap()
    })
}

fn catalog_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)/Type\s*/Catalog\b").unwrap())
}

/// Rewrite `bytes` so the document carries a valid cross-reference table.
pub fn rebuild_xref(bytes: &[u8]) -> Result<Vec<u8>, RepairError> {
    // Every `N G obj` header, in byte order. Later duplicates of an object
    // number win, matching how readers treat incremental updates.
    let mut headers: Vec<(usize, u32, u32)> = Vec::new();
    for caps in object_header_regex().captures_iter(bytes) {
        let (Some(id), Some(gen)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let (Some(id_num), Some(gen_num)) = (parse_number(id.as_bytes()), parse_number(gen.as_bytes()))
        else {
            continue;
        };
        headers.push((id.start(), id_num, gen_num));
    }
    if headers.is_empty() {
        return Err(RepairError::NoObjects);
    }

    let mut objects: BTreeMap<u32, (usize, u32)> = BTreeMap::new();
    for (offset, id, gen) in &headers {
        objects.insert(*id, (*offset, *gen));
    }

    // The trailer needs /Root: take the object whose header most closely
    // precedes a /Type /Catalog entry.
    let catalog_pos = catalog_regex()
        .find(bytes)
        .ok_or(RepairError::MissingCatalog)?
        .start();
    let (root_id, root_gen) = headers
        .iter()
        .filter(|(offset, _, _)| *offset < catalog_pos)
        .max_by_key(|(offset, _, _)| *offset)
        .map(|(_, id, gen)| (*id, *gen))
        .ok_or(RepairError::MissingCatalog)?;

    let Some((&max_id, _)) = objects.last_key_value() else {
        return Err(RepairError::NoObjects);
    };

    let mut out = bytes.to_vec();
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    let xref_pos = out.len();
    out.extend_from_slice(b"xref\n0 1\n0000000000 65535 f\r\n");
    for (start, run) in contiguous_runs(&objects) {
        out.extend_from_slice(format!("{} {}\n", start, run.len()).as_bytes());
        for (offset, gen) in run {
            out.extend_from_slice(format!("{:010} {:05} n\r\n", offset, gen).as_bytes());
        }
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {} {} R >>\nstartxref\n{}\n%%EOF\n",
            max_id + 1,
            root_id,
            root_gen,
            xref_pos
        )
        .as_bytes(),
    );

    tracing::debug!(objects = objects.len(), root = root_id, "Rebuilt PDF xref table");
    Ok(out)
}

fn parse_number(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Split the object map into runs of consecutive object numbers, as xref
/// subsections require.
fn contiguous_runs(objects: &BTreeMap<u32, (usize, u32)>) -> Vec<(u32, Vec<(usize, u32)>)> {
    let mut runs: Vec<(u32, Vec<(usize, u32)>)> = Vec::new();
    for (&id, &entry) in objects {
        match runs.last_mut() {
            Some((start, entries)) if *start + entries.len() as u32 == id => {
                entries.push(entry);
            }
            _ => runs.push((id, vec![entry])),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::extractor::{extract_text, normalize_text};
    use crate::pdf::fixtures::{corrupt_xref, minimal_pdf};

    #[test]
    fn corrupted_xref_fails_extraction_with_repairable_signature() {
        let corrupted = corrupt_xref(minimal_pdf("Borrower: Jane Doe"));
        let err = extract_text(&corrupted).unwrap_err();
        assert!(is_repairable(&err), "signature should be repairable: {err}");
    }

    #[test]
    fn repair_restores_extractability() {
        let corrupted = corrupt_xref(minimal_pdf("Borrower: Jane Doe"));
        assert!(extract_text(&corrupted).is_err());

        let repaired = rebuild_xref(&corrupted).unwrap();
        let result = extract_text(&repaired).unwrap();
        assert!(normalize_text(&result.text).contains("Borrower: Jane Doe"));
    }

    #[test]
    fn repair_of_valid_pdf_keeps_it_valid() {
        let bytes = minimal_pdf("Hello");
        let repaired = rebuild_xref(&bytes).unwrap();
        let result = extract_text(&repaired).unwrap();
        assert!(normalize_text(&result.text).contains("Hello"));
    }

    #[test]
    fn garbage_without_objects_is_not_repairable() {
        let err = rebuild_xref(b"<html>not a pdf</html>").unwrap_err();
        assert!(matches!(err, RepairError::NoObjects));
    }

    #[test]
    fn missing_catalog_is_reported() {
        let payload = b"%PDF-1.4\n1 0 obj\n<< /Length 0 >>\nendobj\n";
        let err = rebuild_xref(payload).unwrap_err();
        assert!(matches!(err, RepairError::MissingCatalog));
    }

    #[test]
    fn garbage_parse_failure_is_not_repairable() {
        let err = extract_text(b"this is not a valid pdf file").unwrap_err();
        // Header-level garbage is not an xref-class failure.
        assert!(!is_repairable(&err), "unexpectedly repairable: {err}");
    }
}
