//! Velocity Core - Document processing and rule evaluation pipeline
//!
//! This crate contains the server-side core of Velocity's loan-origination
//! workflow, including:
//! - Job records and decision artifacts (shared data-model contracts)
//! - Lease-based exclusive claiming over the job store
//! - PDF text extraction (lopdf) with an xref repair fallback
//! - Rule pack / overlay merge and evaluation (regex)
//! - The parsing and analysis workers driven by external ticks
//!
//! The browser UI, authentication, real storage backends, and the scheduler
//! that triggers worker ticks are external collaborators.

pub mod config;
pub mod lease;
pub mod model;
pub mod pdf;
pub mod pipeline;
pub mod rules;
pub mod store;

pub use config::PipelineConfig;
pub use lease::{ClaimedJob, LeaseManager};
pub use model::{Decision, JobRecord, JobState, ProcessingStage};
pub use pipeline::{AnalyzeWorker, ParseWorker, TickOutcome, WorkerError};
pub use store::{Catalog, DocumentStore, FsDocumentStore, JobStore, MemoryCatalog, MemoryJobStore};
