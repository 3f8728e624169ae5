//! Pipeline configuration.
//!
//! Every tunable is an explicit field passed into a worker constructor. The
//! core never reads environment state; the binary that assembles the workers
//! owns whatever config sources it wants.

/// Knobs shared by the parsing worker and the rule evaluation engine.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long a claimed job stays exclusively owned before the lease
    /// self-heals and the job becomes reclaimable.
    pub lease_duration_ms: i64,
    /// Extra download attempts after the first one fails validation.
    pub download_retry_count: u32,
    /// Downloads smaller than this are rejected as truncated.
    pub min_document_bytes: usize,
    /// Matched-substring evidence is clipped to this many characters.
    pub evidence_clip_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 300_000, // 5 minutes
            download_retry_count: 1,
            min_document_bytes: 50,
            evidence_clip_chars: 160,
        }
    }
}
