use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::idempotency::IdempotencyIndex;
use crate::jobs::model::{Job, JobPatch, JobStatus, Metrics, Phase, Progress, StatusCounts};
use crate::jobs::store::{check_transition, clamp_limit, JobStore, NewJob};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    // creation order
    order: Vec<Uuid>,
    idempotency: IdempotencyIndex,
}

/// Process-local job store. One mutex guards jobs and the idempotency index
/// together, so every operation is a single atomic unit.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AuditError::Internal("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> AuditResult<(Uuid, bool)> {
        let mut state = self.lock()?;
        let job = Job::new_queued(new.params, new.idempotency_key, new.timeout_sec, Utc::now());

        if let Some(key) = job.idempotency_key.as_deref() {
            let candidate = job.job_id;
            let (job_id, inserted) = state.idempotency.get_or_insert_with(key, || candidate);
            if !inserted {
                return Ok((job_id, false));
            }
        }

        let job_id = job.job_id;
        state.order.push(job_id);
        state.jobs.insert(job_id, job);
        Ok((job_id, true))
    }

    async fn get(&self, job_id: Uuid) -> AuditResult<Job> {
        self.lock()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(AuditError::NotFound(job_id))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AuditResult<Option<Uuid>> {
        Ok(self.lock()?.idempotency.get(key))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        expected: &[JobStatus],
        new_status: JobStatus,
        patch: JobPatch,
    ) -> AuditResult<bool> {
        check_transition(expected, new_status, &patch)?;

        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(AuditError::NotFound(job_id))?;

        if !expected.contains(&job.status) {
            return Ok(false);
        }

        job.status = new_status;
        job.apply_patch(patch);
        Ok(true)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        phase: Phase,
        percent: u8,
    ) -> AuditResult<bool> {
        let percent = percent.min(100);
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(AuditError::NotFound(job_id))?;

        if job.status != JobStatus::Running {
            return Ok(false);
        }
        if percent < job.progress.percent {
            return Err(AuditError::InvalidProgress {
                current: job.progress.percent,
                attempted: percent,
            });
        }

        job.progress = Progress { phase, percent };
        Ok(true)
    }

    async fn merge_metrics(&self, job_id: Uuid, delta: Metrics) -> AuditResult<bool> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(AuditError::NotFound(job_id))?;

        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.metrics.merge(&delta);
        Ok(true)
    }

    async fn request_cancel(&self, job_id: Uuid) -> AuditResult<bool> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(AuditError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(false);
        }
        job.cancel_requested = true;
        Ok(true)
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> AuditResult<Vec<Job>> {
        let state = self.lock()?;
        let limit = clamp_limit(limit);

        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn queued_ids(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AuditResult<Vec<Uuid>> {
        let state = self.lock()?;
        let limit = limit.max(0) as usize;

        Ok(state
            .order
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(id)
                    .is_some_and(|job| {
                        job.status == JobStatus::Queued && job.created_at <= created_before
                    })
            })
            .take(limit)
            .copied()
            .collect())
    }

    async fn expired_running(&self, now: DateTime<Utc>) -> AuditResult<Vec<Uuid>> {
        let state = self.lock()?;

        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.status == JobStatus::Running && job.deadline_passed(now))
            .map(|job| job.job_id)
            .collect())
    }

    async fn status_counts(&self) -> AuditResult<StatusCounts> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> AuditResult<()> {
        self.lock().map(|_| ())
    }
}
