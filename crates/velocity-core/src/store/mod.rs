//! Abstract stores the pipeline runs against.
//!
//! The object storage and document database are external collaborators; the
//! pipeline only depends on the operations defined here. [`FsDocumentStore`]
//! and the in-memory implementations exist so the crate runs end-to-end
//! without real backends, and so tests can inject failure modes.

mod fs;
mod memory;

pub use fs::FsDocumentStore;
pub use memory::{MemoryCatalog, MemoryJobStore};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{JobRecord, JobState, ProcessingStage, ReleaseReason, WorkerLease};
use crate::rules::{CompanyProfile, Overlay, Program, RulePack};

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("document not found at `{path}`")]
    NotFound { path: String },
    #[error("failed to read document at `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Binary object storage keyed by path.
///
/// Downloads are assumed flaky: callers must treat truncated or otherwise
/// corrupt payloads as a possibility and validate what they receive.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Bytes, DocumentStoreError>;
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job store backend error: {0}")]
    Backend(String),
}

/// Document database holding one record per application.
///
/// `claim_oldest` is the single atomic read-modify-write the leasing scheme
/// depends on; every other write is a field-level merge guarded by the lease
/// the caller already holds.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: JobRecord) -> Result<(), JobStoreError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError>;

    /// Within one transaction: select the oldest-updated job whose stage is
    /// `stage` and whose lease is absent or expired at `now`, write `lease`
    /// onto it, and return a fresh copy. Returns `None` when no job is
    /// eligible; never leaves partial state behind.
    async fn claim_oldest(
        &self,
        stage: ProcessingStage,
        now: DateTime<Utc>,
        lease: WorkerLease,
    ) -> Result<Option<JobRecord>, JobStoreError>;

    /// Replace the job's state payload and bump `updated_at`.
    async fn set_state(&self, id: &str, state: JobState) -> Result<JobRecord, JobStoreError>;

    /// Clear the lease if `holder` still owns it, recording when and why it
    /// was released. A mismatched holder is a no-op: the lease already
    /// expired and someone else reclaimed the job.
    async fn release_lease(
        &self,
        id: &str,
        holder: &str,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Jobs currently in `stage`, oldest-updated first.
    async fn list_stage(
        &self,
        stage: ProcessingStage,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog backend error: {0}")]
    Backend(String),
}

/// Read-only lookups for the reference data evaluation needs.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn company_profile(&self, id: &str) -> Result<Option<CompanyProfile>, CatalogError>;
    async fn rule_pack(&self, id: &str) -> Result<Option<RulePack>, CatalogError>;
    async fn program(&self, id: &str) -> Result<Option<Program>, CatalogError>;
    async fn overlay(&self, id: &str) -> Result<Option<Overlay>, CatalogError>;
}
