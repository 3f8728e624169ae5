//! In-memory reference implementations of the store traits.
//!
//! `MemoryJobStore` holds the whole collection behind one async mutex, so
//! every method body is a transaction: `claim_oldest` reads, re-checks, and
//! writes without any other task observing intermediate state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::{Catalog, CatalogError, JobStore, JobStoreError};
use crate::model::{JobRecord, JobState, ProcessingStage, ReleaseReason, WorkerLease};
use crate::rules::{CompanyProfile, Overlay, Program, RulePack};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `updated_at` must increase strictly on every mutation even when the clock
/// hands out equal timestamps back to back.
fn stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::milliseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

/// Legal stage movement: forward along the pipeline, or sideways into the
/// failed terminal variant. Used as a debug guard; workers re-validate stage
/// from fresh reads before acting.
fn advances(from: ProcessingStage, to: ProcessingStage) -> bool {
    use ProcessingStage::*;
    matches!(
        (from, to),
        (Parsing, Analyzing)
            | (Parsing, ParsingFailed)
            | (Analyzing, AiCompleted)
            | (Parsing, Parsing)
            | (Analyzing, Analyzing)
    )
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Duplicate(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(id).cloned())
    }

    async fn claim_oldest(
        &self,
        stage: ProcessingStage,
        now: DateTime<Utc>,
        lease: WorkerLease,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let mut jobs = self.jobs.lock().await;

        let candidate = jobs
            .values()
            .filter(|job| job.stage() == stage && !job.has_live_lease(now))
            .min_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|job| job.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        // Re-check before writing; the selection above already held the lock
        // but the claim must never land on a drifted record.
        if job.stage() != stage {
            return Ok(None);
        }
        job.lease = Some(lease);
        job.updated_at = stamp(job.updated_at, now);
        Ok(Some(job.clone()))
    }

    async fn set_state(&self, id: &str, state: JobState) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        debug_assert!(
            advances(job.stage(), state.stage()),
            "stage must not regress: {} -> {}",
            job.stage(),
            state.stage()
        );
        job.state = state;
        job.updated_at = stamp(job.updated_at, Utc::now());
        Ok(job.clone())
    }

    async fn release_lease(
        &self,
        id: &str,
        holder: &str,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        let owned = job.lease.as_ref().is_some_and(|l| l.holder == holder);
        if !owned {
            return Ok(());
        }
        job.lease = None;
        job.lease_released_at = Some(now);
        job.lease_release_reason = Some(reason);
        job.updated_at = stamp(job.updated_at, now);
        Ok(())
    }

    async fn list_stage(
        &self,
        stage: ProcessingStage,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.stage() == stage)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out.truncate(limit);
        Ok(out)
    }
}

/// Static reference-data lookups, populated before the workers start.
#[derive(Default)]
pub struct MemoryCatalog {
    profiles: HashMap<String, CompanyProfile>,
    packs: HashMap<String, RulePack>,
    programs: HashMap<String, Program>,
    overlays: HashMap<String, Overlay>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_company_profile(&mut self, profile: CompanyProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn insert_rule_pack(&mut self, pack: RulePack) {
        self.packs.insert(pack.id.clone(), pack);
    }

    pub fn insert_program(&mut self, program: Program) {
        self.programs.insert(program.id.clone(), program);
    }

    pub fn insert_overlay(&mut self, overlay: Overlay) {
        self.overlays.insert(overlay.id.clone(), overlay);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn company_profile(&self, id: &str) -> Result<Option<CompanyProfile>, CatalogError> {
        Ok(self.profiles.get(id).cloned())
    }

    async fn rule_pack(&self, id: &str) -> Result<Option<RulePack>, CatalogError> {
        Ok(self.packs.get(id).cloned())
    }

    async fn program(&self, id: &str) -> Result<Option<Program>, CatalogError> {
        Ok(self.programs.get(id).cloned())
    }

    async fn overlay(&self, id: &str) -> Result<Option<Overlay>, CatalogError> {
        Ok(self.overlays.get(id).cloned())
    }
}
