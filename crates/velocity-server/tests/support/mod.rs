//! Shared fixtures for server integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use lopdf::{dictionary, Document, Object, Stream};
use tempfile::TempDir;

use velocity_core::rules::{CompanyProfile, Rule, RuleKind, RulePack};
use velocity_core::{
    AnalyzeWorker, Catalog, DocumentStore, FsDocumentStore, JobStore, MemoryCatalog,
    MemoryJobStore, ParseWorker, PipelineConfig,
};
use velocity_server::AppState;

pub struct Harness {
    pub state: AppState,
    pub jobs: Arc<dyn JobStore>,
    /// Keeps the document directory alive for the test's duration.
    pub docs_dir: TempDir,
}

/// Build a server state over in-memory stores and a temp document dir.
///
/// `documents` are written into the store root; the catalog maps company
/// profile `cp-1` to a pack containing `rules`.
pub async fn harness(documents: &[(&str, Vec<u8>)], bearer_token: Option<&str>) -> Harness {
    let docs_dir = TempDir::new().expect("temp dir");
    for (name, bytes) in documents {
        std::fs::write(docs_dir.path().join(name), bytes).expect("write test document");
    }

    let mut catalog = MemoryCatalog::new();
    catalog.insert_company_profile(CompanyProfile {
        id: "cp-1".into(),
        rule_pack_id: Some("pack-1".into()),
    });
    catalog.insert_rule_pack(RulePack {
        id: "pack-1".into(),
        version: "2024-11".into(),
        rules: vec![Rule {
            id: "c-doe".into(),
            title: "Borrower surname flagged for manual review".into(),
            severity: None,
            pattern: "Doe".into(),
            kind: RuleKind::Condition,
        }],
    });

    let documents: Arc<dyn DocumentStore> = Arc::new(FsDocumentStore::new(docs_dir.path()));
    let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let catalog: Arc<dyn Catalog> = Arc::new(catalog);

    let pipeline = PipelineConfig::default();
    let state = AppState {
        parse: Arc::new(ParseWorker::new(documents, jobs.clone(), pipeline.clone())),
        analyze: Arc::new(AnalyzeWorker::new(jobs.clone(), catalog, pipeline)),
        jobs: jobs.clone(),
        bearer_token: bearer_token.map(str::to_string),
    };

    Harness {
        state,
        jobs,
        docs_dir,
    }
}

/// Build a one-page PDF containing `text`.
pub fn minimal_pdf(text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.4");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });

    let escaped = text
        .replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)");
    let content = format!("BT /F1 11 Tf 72 720 Td ({escaped}) Tj ET");
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        },
        "Contents" => content_id,
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}
