//! Parsing worker: turns one uploaded document into extracted text.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;

use super::{TickOutcome, WorkerError};
use crate::config::PipelineConfig;
use crate::lease::{ClaimedJob, LeaseManager};
use crate::model::{Extraction, ExtractorKind, JobState, ProcessingStage, ReleaseReason};
use crate::pdf::{self, ExtractError, ExtractedText, RepairError};
use crate::store::{DocumentStore, JobStore, JobStoreError};

/// Job-local reasons a parse attempt ends in `parsing_failed`.
///
/// The rendered message is what operators see on the record, so each variant
/// spells out what happened and what was already tried.
#[derive(Debug, Error)]
enum ParseFailure {
    #[error("download failed after {attempts} attempt(s): {last_error}")]
    Download { attempts: u32, last_error: String },
    #[error("text extraction failed: {0}")]
    Extract(#[source] ExtractError),
    #[error("xref repair failed: {0}")]
    Repair(#[source] RepairError),
    #[error("extraction of repaired document failed: {0}")]
    ExtractRepaired(#[source] ExtractError),
    #[error("document parsed but produced no text")]
    EmptyText,
}

/// Drains at most one `parsing`-stage job per invocation.
pub struct ParseWorker {
    documents: Arc<dyn DocumentStore>,
    jobs: Arc<dyn JobStore>,
    leases: LeaseManager,
    config: PipelineConfig,
}

impl ParseWorker {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        jobs: Arc<dyn JobStore>,
        config: PipelineConfig,
    ) -> Self {
        let leases = LeaseManager::new(jobs.clone(), config.lease_duration_ms);
        Self {
            documents,
            jobs,
            leases,
            config,
        }
    }

    /// Claim one parsing job, extract its text, and advance it.
    ///
    /// Returns `Idle` when nothing is claimable. A job whose document cannot
    /// be parsed is moved to `parsing_failed` with an operator-readable
    /// error; that is a handled outcome, not an `Err`.
    pub async fn process_one(&self) -> Result<TickOutcome, WorkerError> {
        let Some(claim) = self.leases.claim_one(ProcessingStage::Parsing).await? else {
            return Ok(TickOutcome::Idle);
        };
        let ClaimedJob { job, holder } = claim;
        let job_id = job.id.clone();

        // Act only on a fresh read; the claim copy may already be stale.
        let Some(job) = self.jobs.get(&job_id).await? else {
            return Err(JobStoreError::NotFound(job_id).into());
        };
        if job.stage() != ProcessingStage::Parsing {
            tracing::info!(job_id = %job_id, stage = %job.stage(), "Stage drifted since claim; skipping");
            self.leases
                .release(&job_id, &holder, ReleaseReason::Skipped)
                .await;
            return Ok(TickOutcome::Skipped { job_id });
        }

        let Some(object_path) = job.object_path.clone() else {
            // Missing required input: fail permanently rather than retry
            // blindly; an operator must fix the record.
            return self
                .fail(
                    &job_id,
                    &holder,
                    "job record has no object path; restore the upload reference before retrying"
                        .to_string(),
                )
                .await;
        };

        match self.extract(&object_path).await {
            Ok(extraction) => {
                tracing::info!(
                    job_id = %job_id,
                    chars = extraction.length,
                    extractor = ?extraction.extractor,
                    fallback = extraction.fallback_used,
                    "Document parsed"
                );
                self.jobs
                    .set_state(&job_id, JobState::Analyzing { extraction })
                    .await?;
                self.leases
                    .release(&job_id, &holder, ReleaseReason::Success)
                    .await;
                Ok(TickOutcome::Processed {
                    job_id,
                    error: None,
                })
            }
            Err(failure) => self.fail(&job_id, &holder, failure.to_string()).await,
        }
    }

    async fn fail(
        &self,
        job_id: &str,
        holder: &str,
        error: String,
    ) -> Result<TickOutcome, WorkerError> {
        tracing::warn!(job_id = %job_id, error = %error, "Parsing failed");
        self.jobs
            .set_state(
                job_id,
                JobState::ParsingFailed {
                    error: error.clone(),
                    failed_at: Utc::now(),
                },
            )
            .await?;
        self.leases
            .release(job_id, holder, ReleaseReason::Failed)
            .await;
        Ok(TickOutcome::Processed {
            job_id: job_id.to_string(),
            error: Some(error),
        })
    }

    /// Download, extract, and normalize; the full fallback ladder.
    async fn extract(&self, path: &str) -> Result<Extraction, ParseFailure> {
        let bytes = self.download_validated(path).await?;

        let (raw, extractor, fallback_used) = match pdf::extract_text(&bytes) {
            Ok(doc) => (doc, ExtractorKind::Lopdf, false),
            Err(first_error) => {
                // A corrupt download and a corrupt document look the same
                // here; one fresh download settles which it was.
                tracing::debug!(path = %path, error = %first_error, "Primary extraction failed; re-downloading");
                let bytes = self.download_validated(path).await?;
                match pdf::extract_text(&bytes) {
                    Ok(doc) => (doc, ExtractorKind::Lopdf, false),
                    Err(second_error) if pdf::is_repairable(&second_error) => {
                        tracing::warn!(path = %path, error = %second_error, "Attempting xref repair fallback");
                        let fresh = self.download_validated(path).await?;
                        let repaired =
                            pdf::rebuild_xref(&fresh).map_err(ParseFailure::Repair)?;
                        let doc = pdf::extract_text(&repaired)
                            .map_err(ParseFailure::ExtractRepaired)?;
                        (doc, ExtractorKind::LopdfRepaired, true)
                    }
                    Err(second_error) => return Err(ParseFailure::Extract(second_error)),
                }
            }
        };

        self.finish(raw, extractor, fallback_used)
    }

    fn finish(
        &self,
        raw: ExtractedText,
        extractor: ExtractorKind,
        fallback_used: bool,
    ) -> Result<Extraction, ParseFailure> {
        let text = pdf::normalize_text(&raw.text);
        // A job must never advance with no usable content.
        if text.is_empty() {
            return Err(ParseFailure::EmptyText);
        }
        Ok(Extraction {
            length: text.len(),
            text,
            extractor,
            fallback_used,
        })
    }

    /// Fetch and validate, retrying the whole download on any failure.
    async fn download_validated(&self, path: &str) -> Result<Bytes, ParseFailure> {
        let attempts = 1 + self.config.download_retry_count;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.documents.download(path).await {
                Ok(bytes) => match validate_payload(&bytes, self.config.min_document_bytes) {
                    Ok(()) => return Ok(bytes),
                    Err(reason) => last_error = reason,
                },
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(path = %path, attempt, error = %last_error, "Download attempt failed");
        }
        Err(ParseFailure::Download {
            attempts,
            last_error,
        })
    }
}

/// Reject payloads that cannot be the uploaded document: trivially small
/// ones, and HTML bodies that an auth redirect or a 404 page would produce.
fn validate_payload(bytes: &[u8], min_bytes: usize) -> Result<(), String> {
    if bytes.len() < min_bytes {
        return Err(format!(
            "payload is {} bytes, below the {}-byte minimum",
            bytes.len(),
            min_bytes
        ));
    }
    if looks_like_markup(bytes) {
        return Err("payload looks like an HTML error page, not a document".to_string());
    }
    Ok(())
}

fn looks_like_markup(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let prefix: Vec<u8> = bytes[start..]
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    prefix.starts_with(b"<!doctype") || prefix.starts_with(b"<html")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;

    use super::*;
    use crate::model::{JobRecord, WorkerLease};
    use crate::pdf::fixtures::{corrupt_xref, minimal_pdf};
    use crate::store::{DocumentStoreError, MemoryJobStore};

    /// Serves scripted payloads in order, repeating the last one forever.
    struct ScriptedDocs {
        responses: Mutex<VecDeque<Bytes>>,
        last: Bytes,
    }

    impl ScriptedDocs {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            let mut queue: VecDeque<Bytes> = responses.into_iter().map(Bytes::from).collect();
            let last = queue.back().cloned().unwrap_or_default();
            queue.pop_back();
            Self {
                responses: Mutex::new(queue),
                last,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for ScriptedDocs {
        async fn download(&self, _path: &str) -> Result<Bytes, DocumentStoreError> {
            let mut queue = self.responses.lock().await;
            Ok(queue.pop_front().unwrap_or_else(|| self.last.clone()))
        }
    }

    /// Delegates to a `MemoryJobStore`, optionally misbehaving to exercise
    /// the drift and unexpected-failure paths.
    struct InstrumentedStore {
        inner: MemoryJobStore,
        drift_on_get: AtomicBool,
        fail_set_state: AtomicBool,
    }

    impl InstrumentedStore {
        fn new() -> Self {
            Self {
                inner: MemoryJobStore::new(),
                drift_on_get: AtomicBool::new(false),
                fail_set_state: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl JobStore for InstrumentedStore {
        async fn insert(&self, job: JobRecord) -> Result<(), JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError> {
            let job = self.inner.get(id).await?;
            if self.drift_on_get.load(Ordering::SeqCst) {
                // Pretend another agent advanced the job since the claim.
                return Ok(job.map(|mut job| {
                    job.state = JobState::Analyzing {
                        extraction: Extraction {
                            text: "already parsed elsewhere".into(),
                            length: 23,
                            extractor: ExtractorKind::Lopdf,
                            fallback_used: false,
                        },
                    };
                    job
                }));
            }
            Ok(job)
        }

        async fn claim_oldest(
            &self,
            stage: ProcessingStage,
            now: DateTime<Utc>,
            lease: WorkerLease,
        ) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.claim_oldest(stage, now, lease).await
        }

        async fn set_state(&self, id: &str, state: JobState) -> Result<JobRecord, JobStoreError> {
            if self.fail_set_state.load(Ordering::SeqCst) {
                return Err(JobStoreError::Backend("write rejected".into()));
            }
            self.inner.set_state(id, state).await
        }

        async fn release_lease(
            &self,
            id: &str,
            holder: &str,
            reason: ReleaseReason,
            now: DateTime<Utc>,
        ) -> Result<(), JobStoreError> {
            self.inner.release_lease(id, holder, reason, now).await
        }

        async fn list_stage(
            &self,
            stage: ProcessingStage,
            limit: usize,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list_stage(stage, limit).await
        }
    }

    fn worker_with(
        responses: Vec<Vec<u8>>,
        jobs: Arc<dyn JobStore>,
    ) -> ParseWorker {
        ParseWorker::new(
            Arc::new(ScriptedDocs::new(responses)),
            jobs,
            PipelineConfig::default(),
        )
    }

    async fn seed_job(jobs: &Arc<dyn JobStore>, object_path: Option<&str>) -> String {
        let mut job = JobRecord::new("placeholder.pdf", Some("cp-1".into()), None);
        job.object_path = object_path.map(Into::into);
        let id = job.id.clone();
        jobs.insert(job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn happy_path_advances_to_analyzing() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let worker = worker_with(vec![minimal_pdf("Borrower: Jane Doe")], jobs.clone());

        let outcome = worker.process_one().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                job_id: id.clone(),
                error: None
            }
        );

        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::Analyzing);
        let JobState::Analyzing { extraction } = &job.state else {
            panic!("expected analyzing state");
        };
        assert!(extraction.text.contains("Borrower: Jane Doe"));
        assert!(extraction.length > 0);
        assert_eq!(extraction.length, extraction.text.len());
        assert_eq!(extraction.extractor, ExtractorKind::Lopdf);
        assert!(!extraction.fallback_used);
        assert!(job.lease.is_none());
        assert_eq!(job.lease_release_reason, Some(ReleaseReason::Success));
    }

    #[tokio::test]
    async fn no_eligible_job_is_idle_not_an_error() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let worker = worker_with(vec![minimal_pdf("x")], jobs);
        assert_eq!(worker.process_one().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn truncated_download_is_retried_once_then_succeeds() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let worker = worker_with(
            vec![b"tiny".to_vec(), minimal_pdf("Borrower: Jane Doe")],
            jobs.clone(),
        );

        let outcome = worker.process_one().await.unwrap();
        assert_eq!(outcome.processed(), 1);
        assert!(outcome.error().is_none());
        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::Analyzing);
    }

    #[tokio::test]
    async fn persistent_html_payload_fails_the_job() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let html = b"<html><body>403 Forbidden and some padding to get past the size floor</body></html>".to_vec();
        let worker = worker_with(vec![html], jobs.clone());

        let outcome = worker.process_one().await.unwrap();
        assert_eq!(outcome.processed(), 1);
        assert!(outcome.error().unwrap().contains("HTML"));

        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::ParsingFailed);
        let JobState::ParsingFailed { error, .. } = &job.state else {
            panic!("expected parsing_failed state");
        };
        assert!(error.contains("2 attempt(s)"));
        assert_eq!(job.lease_release_reason, Some(ReleaseReason::Failed));
    }

    #[tokio::test]
    async fn missing_object_path_fails_permanently() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, None).await;
        let worker = worker_with(vec![minimal_pdf("x")], jobs.clone());

        let outcome = worker.process_one().await.unwrap();
        assert!(outcome.error().unwrap().contains("object path"));
        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::ParsingFailed);
    }

    #[tokio::test]
    async fn corrupt_xref_is_repaired_via_fallback() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let corrupted = corrupt_xref(minimal_pdf("Borrower: Jane Doe"));
        let worker = worker_with(vec![corrupted], jobs.clone());

        let outcome = worker.process_one().await.unwrap();
        assert!(outcome.error().is_none(), "repair should succeed: {outcome:?}");

        let job = jobs.get(&id).await.unwrap().unwrap();
        let JobState::Analyzing { extraction } = &job.state else {
            panic!("expected analyzing state, got {:?}", job.state);
        };
        assert!(extraction.fallback_used);
        assert_eq!(extraction.extractor, ExtractorKind::LopdfRepaired);
        assert!(extraction.text.contains("Borrower: Jane Doe"));
    }

    #[tokio::test]
    async fn empty_extracted_text_is_a_failure_not_a_blank_advance() {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let worker = worker_with(vec![minimal_pdf("")], jobs.clone());

        let outcome = worker.process_one().await.unwrap();
        assert!(outcome.error().unwrap().contains("no text"));
        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::ParsingFailed);
    }

    #[tokio::test]
    async fn drifted_stage_releases_skipped_without_mutation() {
        let store = Arc::new(InstrumentedStore::new());
        store.drift_on_get.store(true, Ordering::SeqCst);
        let jobs: Arc<dyn JobStore> = store.clone();
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let worker = worker_with(vec![minimal_pdf("x")], jobs);

        let outcome = worker.process_one().await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped { job_id: id.clone() });

        // The authoritative record was not advanced or failed by this tick.
        let job = store.inner.get(&id).await.unwrap().unwrap();
        assert_eq!(job.stage(), ProcessingStage::Parsing);
        assert!(job.lease.is_none());
        assert_eq!(job.lease_release_reason, Some(ReleaseReason::Skipped));
    }

    #[tokio::test]
    async fn unexpected_store_failure_leaves_lease_to_expire() {
        let store = Arc::new(InstrumentedStore::new());
        store.fail_set_state.store(true, Ordering::SeqCst);
        let jobs: Arc<dyn JobStore> = store.clone();
        let id = seed_job(&jobs, Some("app.pdf")).await;
        let worker = worker_with(vec![minimal_pdf("Borrower: Jane Doe")], jobs);

        let result = worker.process_one().await;
        assert!(result.is_err(), "store failure must surface as WorkerError");

        // The lease is intentionally not released; it self-heals at expiry.
        let job = store.inner.get(&id).await.unwrap().unwrap();
        assert!(job.lease.is_some());
        assert_eq!(job.stage(), ProcessingStage::Parsing);
    }

    #[test]
    fn markup_detection_tolerates_leading_whitespace_and_case() {
        assert!(looks_like_markup(b"  \n<!DOCTYPE html><html>"));
        assert!(looks_like_markup(b"<HTML><body>"));
        assert!(!looks_like_markup(b"%PDF-1.4 binary"));
        assert!(!looks_like_markup(b""));
    }
}
