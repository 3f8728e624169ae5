//! Rule evaluation engine: merges rule packs and emits a decision.

use std::sync::Arc;

use chrono::Utc;

use super::{TickOutcome, WorkerError};
use crate::config::PipelineConfig;
use crate::lease::{ClaimedJob, LeaseManager};
use crate::model::{
    Decision, DecisionArtifact, Extraction, JobState, ProcessingStage, RawDecisionArtifact,
    ReleaseReason,
};
use crate::rules::{self, Overlay, RulePack};
use crate::store::{Catalog, JobStore, JobStoreError};

/// Drains at most one `analyzing`-stage job per invocation.
///
/// Missing relationship data (no company profile, no rule pack) never
/// crashes a tick and never passes a loan: the job completes with decision
/// forced to `conditional` and the cause recorded on the record.
pub struct AnalyzeWorker {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn Catalog>,
    leases: LeaseManager,
    config: PipelineConfig,
}

impl AnalyzeWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: Arc<dyn Catalog>,
        config: PipelineConfig,
    ) -> Self {
        let leases = LeaseManager::new(jobs.clone(), config.lease_duration_ms);
        Self {
            jobs,
            catalog,
            leases,
            config,
        }
    }

    pub async fn process_one(&self) -> Result<TickOutcome, WorkerError> {
        let Some(claim) = self.leases.claim_one(ProcessingStage::Analyzing).await? else {
            return Ok(TickOutcome::Idle);
        };
        let ClaimedJob { job, holder } = claim;
        let job_id = job.id.clone();

        let Some(job) = self.jobs.get(&job_id).await? else {
            return Err(JobStoreError::NotFound(job_id).into());
        };
        let JobState::Analyzing { extraction } = job.state.clone() else {
            tracing::info!(job_id = %job_id, stage = %job.stage(), "Stage drifted since claim; skipping");
            self.leases
                .release(&job_id, &holder, ReleaseReason::Skipped)
                .await;
            return Ok(TickOutcome::Skipped { job_id });
        };

        // Required inputs, checked in strict order. Each miss completes the
        // job fail-closed rather than leaving it stuck or silently passing.
        let Some(company_profile_id) = job.company_profile_id.clone() else {
            return self
                .complete_fail_closed(
                    &job_id,
                    &holder,
                    extraction,
                    "job has no company profile reference".to_string(),
                )
                .await;
        };
        if extraction.text.trim().is_empty() {
            return self
                .complete_fail_closed(
                    &job_id,
                    &holder,
                    extraction,
                    "no extracted text available for evaluation".to_string(),
                )
                .await;
        }
        let Some(profile) = self.catalog.company_profile(&company_profile_id).await? else {
            return self
                .complete_fail_closed(
                    &job_id,
                    &holder,
                    extraction,
                    format!("company profile `{company_profile_id}` not found"),
                )
                .await;
        };
        let Some(rule_pack_id) = profile.rule_pack_id else {
            return self
                .complete_fail_closed(
                    &job_id,
                    &holder,
                    extraction,
                    format!("company profile `{company_profile_id}` has no rule pack configured"),
                )
                .await;
        };
        let Some(pack) = self.catalog.rule_pack(&rule_pack_id).await? else {
            return self
                .complete_fail_closed(
                    &job_id,
                    &holder,
                    extraction,
                    format!("rule pack `{rule_pack_id}` not found"),
                )
                .await;
        };

        let overlay = self.resolve_overlay(job.program_id.as_deref()).await?;
        let (public, raw, decision) = self.evaluate(&pack, overlay.as_ref(), &extraction.text);

        tracing::info!(
            job_id = %job_id,
            decision = %decision,
            findings = public.findings.len(),
            conditions = public.conditions.len(),
            blockers = raw.blockers.len(),
            overlay = public.overlay_applied,
            "Evaluation complete"
        );

        self.jobs
            .set_state(
                &job_id,
                JobState::AiCompleted {
                    extraction,
                    decision,
                    public,
                    raw,
                    error: None,
                },
            )
            .await?;
        self.leases
            .release(&job_id, &holder, ReleaseReason::Success)
            .await;
        Ok(TickOutcome::Processed {
            job_id,
            error: None,
        })
    }

    /// A program without an overlay (or a job without a program) is normal;
    /// evaluation proceeds with base rules only.
    async fn resolve_overlay(
        &self,
        program_id: Option<&str>,
    ) -> Result<Option<Overlay>, WorkerError> {
        let Some(program_id) = program_id else {
            return Ok(None);
        };
        let Some(program) = self.catalog.program(program_id).await? else {
            tracing::debug!(program_id = %program_id, "Program not found; evaluating base rules only");
            return Ok(None);
        };
        let Some(overlay_id) = program.active_overlay_id else {
            return Ok(None);
        };
        let overlay = self.catalog.overlay(&overlay_id).await?;
        if overlay.is_none() {
            tracing::debug!(overlay_id = %overlay_id, "Active overlay not found; evaluating base rules only");
        }
        Ok(overlay)
    }

    fn evaluate(
        &self,
        pack: &RulePack,
        overlay: Option<&Overlay>,
        text: &str,
    ) -> (DecisionArtifact, RawDecisionArtifact, Decision) {
        let merged = rules::merge_rules(pack, overlay);
        let rule_count = merged.len();
        let evaluation = rules::evaluate(&merged, text, self.config.evidence_clip_chars);
        let decision = rules::decide(&evaluation);

        let summary = format!(
            "{}: {} blocker(s), {} condition(s), {} finding(s) matched from {} rule(s)",
            decision,
            evaluation.blockers.len(),
            evaluation.conditions.len(),
            evaluation.findings.len(),
            rule_count,
        );
        let mut notes = Vec::new();
        if evaluation.skipped_invalid > 0 {
            notes.push(format!(
                "{} rule pattern(s) failed to compile and were skipped",
                evaluation.skipped_invalid
            ));
        }

        let public = DecisionArtifact {
            decision,
            summary,
            findings: evaluation.findings,
            conditions: evaluation.conditions,
            overlay_applied: overlay.is_some(),
            overlay_id: overlay.map(|o| o.id.clone()),
            overlay_name: overlay.map(|o| o.name.clone()),
            overlay_rule_count: overlay.map(|o| o.rules.len()).unwrap_or(0),
            evaluated_at: Utc::now(),
        };
        let raw = RawDecisionArtifact {
            public: public.clone(),
            blockers: evaluation.blockers,
            rule_pack_version: Some(pack.version.clone()),
            notes,
        };
        (public, raw, decision)
    }

    /// Terminate evaluation early with the decision forced to `conditional`.
    ///
    /// Missing data must never imply approval, and the job must not stay
    /// stuck in `analyzing`: it completes with the cause on the record. The
    /// lease is released as "failed" even though the tick reports a handled
    /// outcome to its caller.
    async fn complete_fail_closed(
        &self,
        job_id: &str,
        holder: &str,
        extraction: Extraction,
        error: String,
    ) -> Result<TickOutcome, WorkerError> {
        tracing::warn!(job_id = %job_id, error = %error, "Evaluation fail-closed on missing inputs");

        let public = DecisionArtifact {
            decision: Decision::Conditional,
            summary: format!("evaluation incomplete: {error}; decision forced to conditional"),
            findings: Vec::new(),
            conditions: Vec::new(),
            overlay_applied: false,
            overlay_id: None,
            overlay_name: None,
            overlay_rule_count: 0,
            evaluated_at: Utc::now(),
        };
        let raw = RawDecisionArtifact {
            public: public.clone(),
            blockers: Vec::new(),
            rule_pack_version: None,
            notes: vec![format!("fail-closed: {error}")],
        };
        self.jobs
            .set_state(
                job_id,
                JobState::AiCompleted {
                    extraction,
                    decision: Decision::Conditional,
                    public,
                    raw,
                    error: Some(error.clone()),
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
}
