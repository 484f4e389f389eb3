use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::model::{AuditParams, Job, JobPatch, JobStatus, Metrics, Phase, StatusCounts};

#[derive(Debug, Clone)]
pub struct NewJob {
    pub params: AuditParams,
    pub idempotency_key: Option<String>,
    /// Effective timeout for the job, already capped.
    pub timeout_sec: u64,
}

/// Single source of truth for job state.
///
/// Every mutation path (worker, cancel supervisor, timeout supervisor) goes
/// through `transition`, `update_progress`, `merge_metrics` or
/// `request_cancel`. Each of those is atomic with respect to the others.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Create a queued job, or return the job already bound to the
    /// idempotency key with `created = false` and no write.
    async fn create(&self, new: NewJob) -> AuditResult<(Uuid, bool)>;

    async fn get(&self, job_id: Uuid) -> AuditResult<Job>;

    /// Job id already bound to `key`, if any. Read-only.
    async fn find_by_idempotency_key(&self, key: &str) -> AuditResult<Option<Uuid>>;

    /// Move `job_id` to `new_status` and apply `patch`, only if its current
    /// status is in `expected`. Returns false (and changes nothing) otherwise.
    async fn transition(
        &self,
        job_id: Uuid,
        expected: &[JobStatus],
        new_status: JobStatus,
        patch: JobPatch,
    ) -> AuditResult<bool>;

    /// Record progress on a running job. Lowering the percent fails with
    /// `InvalidProgress`; returns false if the job is no longer running.
    async fn update_progress(&self, job_id: Uuid, phase: Phase, percent: u8)
        -> AuditResult<bool>;

    /// Accumulate metrics on a running job. Returns false if not running.
    async fn merge_metrics(&self, job_id: Uuid, delta: Metrics) -> AuditResult<bool>;

    /// Set `cancel_requested` on a non-terminal job. Returns false if the job
    /// is already terminal.
    async fn request_cancel(&self, job_id: Uuid) -> AuditResult<bool>;

    /// Newest first. `limit` is clamped to 1..=500.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> AuditResult<Vec<Job>>;

    /// Queued job ids created at or before `created_before`, oldest first.
    async fn queued_ids(&self, created_before: DateTime<Utc>, limit: i64)
        -> AuditResult<Vec<Uuid>>;

    /// Running jobs whose deadline is at or before `now`.
    async fn expired_running(&self, now: DateTime<Utc>) -> AuditResult<Vec<Uuid>>;

    async fn status_counts(&self) -> AuditResult<StatusCounts>;

    async fn ping(&self) -> AuditResult<()>;
}

/// Reject transitions the state machine does not allow, and enforce that a
/// report reference travels with `succeeded` and only with it.
pub(crate) fn check_transition(
    expected: &[JobStatus],
    new_status: JobStatus,
    patch: &JobPatch,
) -> AuditResult<()> {
    if expected.is_empty() {
        return Err(AuditError::Internal(
            "transition needs at least one expected status".into(),
        ));
    }
    if let Some(from) = expected.iter().find(|s| !s.can_transition_to(new_status)) {
        return Err(AuditError::Internal(format!(
            "edge {from} -> {new_status} is not part of the job state machine"
        )));
    }
    match (new_status, patch.report_ref.is_some()) {
        (JobStatus::Succeeded, false) => Err(AuditError::Internal(
            "succeeded transition requires a report reference".into(),
        )),
        (s, true) if s != JobStatus::Succeeded => Err(AuditError::Internal(format!(
            "report reference is only allowed on succeeded, not {s}"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn clamp_limit(limit: i64) -> usize {
    limit.clamp(1, 500) as usize
}
