//! Lease-based exclusive claiming of jobs.
//!
//! There is no central lock service: a claim is an optimistic write of a
//! short-lived lease inside the job store's atomic claim transaction. If the
//! holder crashes before releasing, the lease self-heals once `expires_at`
//! passes and another worker reclaims the job. That makes delivery
//! at-least-once, not at-most-once; workers must re-validate stage from a
//! fresh read before acting on a claim.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::model::{JobRecord, ProcessingStage, ReleaseReason, WorkerLease};
use crate::store::{JobStore, JobStoreError};

/// A successfully claimed job plus the holder id that owns its lease.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRecord,
    pub holder: String,
}

pub struct LeaseManager {
    jobs: Arc<dyn JobStore>,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(jobs: Arc<dyn JobStore>, lease_duration_ms: i64) -> Self {
        Self {
            jobs,
            lease_duration: Duration::milliseconds(lease_duration_ms),
        }
    }

    /// Claim the single oldest-updated eligible job in `stage`.
    ///
    /// Returns `None` when nothing is eligible. Concurrent claims race inside
    /// the store transaction; exactly one caller wins.
    pub async fn claim_one(
        &self,
        stage: ProcessingStage,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let now = Utc::now();
        let holder = Uuid::new_v4().to_string();
        let lease = WorkerLease {
            holder: holder.clone(),
            stage,
            claimed_at: now,
            expires_at: now + self.lease_duration,
        };

        let Some(job) = self.jobs.claim_oldest(stage, now, lease).await? else {
            return Ok(None);
        };
        tracing::debug!(job_id = %job.id, stage = %stage, holder = %holder, "Claimed job");
        Ok(Some(ClaimedJob { job, holder }))
    }

    /// Best-effort lease cleanup. Failures are logged and swallowed: a lease
    /// that cannot be released now will self-heal at expiry.
    pub async fn release(&self, job_id: &str, holder: &str, reason: ReleaseReason) {
        if let Err(e) = self
            .jobs
            .release_lease(job_id, holder, reason, Utc::now())
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to release lease");
        }
    }
}
