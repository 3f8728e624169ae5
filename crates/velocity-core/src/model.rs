//! Shared data-model contracts for the processing pipeline.
//!
//! One [`JobRecord`] exists per application document. Its [`JobState`] is a
//! tagged sum type, so the fields a job may legally carry are enforced by the
//! type system rather than by convention: a job cannot hold a decision before
//! it holds extracted text, and a failed parse cannot hold extraction output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The job's primary state-machine field, derived from [`JobState`].
///
/// Workers filter claims on this value. The pipeline only ever moves a job
/// forward along `parsing -> analyzing -> ai_completed`, or sideways into
/// `parsing_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Parsing,
    ParsingFailed,
    Analyzing,
    AiCompleted,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Parsing => "parsing",
            ProcessingStage::ParsingFailed => "parsing_failed",
            ProcessingStage::Analyzing => "analyzing",
            ProcessingStage::AiCompleted => "ai_completed",
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underwriting decision for one evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Conditional,
    Fail,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Conditional => "conditional",
            Decision::Fail => "fail",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which extraction path produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Lopdf,
    LopdfRepaired,
}

/// Extraction output written once by the parsing worker on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    /// Normalized extracted text (unified line endings, trimmed).
    pub text: String,
    /// Byte length of `text`.
    pub length: usize,
    pub extractor: ExtractorKind,
    /// True when the repair fallback produced the parseable bytes.
    pub fallback_used: bool,
}

/// Severity attached to a rule hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Whether a hit came from the company's base pack or a program overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Base,
    Overlay,
}

/// One matched rule, as exposed in decision artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleHit {
    pub rule_id: String,
    pub title: String,
    pub severity: Severity,
    /// First matched substring, clipped to the configured evidence length.
    pub evidence: String,
    pub source: RuleSource,
}

/// Borrower/program-facing evaluation output.
///
/// Serialized with camelCase keys since this shape is consumed by the
/// dashboard and reporting as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionArtifact {
    pub decision: Decision,
    pub summary: String,
    pub findings: Vec<RuleHit>,
    pub conditions: Vec<RuleHit>,
    pub overlay_applied: bool,
    pub overlay_id: Option<String>,
    pub overlay_name: Option<String>,
    pub overlay_rule_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// Internal evaluation output: the public artifact plus the fields that are
/// not exposed to borrowers. Derivation is identical; only exposure differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDecisionArtifact {
    #[serde(flatten)]
    pub public: DecisionArtifact,
    pub blockers: Vec<RuleHit>,
    pub rule_pack_version: Option<String>,
    pub notes: Vec<String>,
}

/// Per-stage job payload. Advancing a stage replaces the whole state, which
/// also clears any prior error fields without a separate write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum JobState {
    Parsing,
    ParsingFailed {
        error: String,
        failed_at: DateTime<Utc>,
    },
    Analyzing {
        extraction: Extraction,
    },
    AiCompleted {
        extraction: Extraction,
        decision: Decision,
        public: DecisionArtifact,
        raw: RawDecisionArtifact,
        /// Present when evaluation completed fail-closed on missing inputs.
        error: Option<String>,
    },
}

impl JobState {
    pub fn stage(&self) -> ProcessingStage {
        match self {
            JobState::Parsing => ProcessingStage::Parsing,
            JobState::ParsingFailed { .. } => ProcessingStage::ParsingFailed,
            JobState::Analyzing { .. } => ProcessingStage::Analyzing,
            JobState::AiCompleted { .. } => ProcessingStage::AiCompleted,
        }
    }
}

/// Reason recorded when a worker releases its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Success,
    Failed,
    Skipped,
}

/// Time-bounded exclusive claim on a job.
///
/// Exists only while a worker owns the job. A crashed worker's lease is never
/// cleaned up explicitly; it becomes reclaimable once `expires_at` passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLease {
    pub holder: String,
    pub stage: ProcessingStage,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkerLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One application's per-document processing state and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// Reference into the document store. Set at creation; a record without
    /// one cannot be parsed and is failed permanently by the parsing worker.
    pub object_path: Option<String>,
    pub company_profile_id: Option<String>,
    pub program_id: Option<String>,
    pub state: JobState,
    pub lease: Option<WorkerLease>,
    pub lease_released_at: Option<DateTime<Utc>>,
    pub lease_release_reason: Option<ReleaseReason>,
    /// Bumped on every mutation; claim ordering key (oldest first).
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a record for a freshly uploaded document, ready for parsing.
    pub fn new(
        object_path: impl Into<String>,
        company_profile_id: Option<String>,
        program_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object_path: Some(object_path.into()),
            company_profile_id,
            program_id,
            state: JobState::Parsing,
            lease: None,
            lease_released_at: None,
            lease_release_reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn stage(&self) -> ProcessingStage {
        self.state.stage()
    }

    /// True when a lease exists and has not yet expired.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }
}
