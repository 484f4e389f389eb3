use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::model::{JobPatch, JobStatus};
use crate::jobs::store::JobStore;

pub const CANCELED_MESSAGE: &str = "canceled";
pub const EXPIRED_MESSAGE: &str = "timeout: job exceeded its deadline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

/// Applies cancel requests. Queued jobs are canceled on the spot; running
/// jobs only get the flag and are stopped by their worker at the next
/// checkpoint.
#[derive(Clone)]
pub struct CancelSupervisor {
    store: Arc<dyn JobStore>,
}

impl CancelSupervisor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn cancel(&self, job_id: Uuid) -> AuditResult<CancelOutcome> {
        // Flag first: if a worker picks the job up between the two steps it
        // still sees the request at its first checkpoint.
        if !self.store.request_cancel(job_id).await? {
            let job = self.store.get(job_id).await?;
            return Err(AuditError::InvalidStateTransition { status: job.status });
        }

        let patch = JobPatch::finished(Utc::now()).with_error(CANCELED_MESSAGE);
        if self
            .store
            .transition(job_id, &[JobStatus::Queued], JobStatus::Canceled, patch)
            .await?
        {
            info!(job_id = %job_id, "queued job canceled");
            return Ok(CancelOutcome {
                job_id,
                status: JobStatus::Canceled,
                cancel_requested: true,
            });
        }

        let job = self.store.get(job_id).await?;
        info!(job_id = %job_id, status = %job.status, "cancel requested");
        Ok(CancelOutcome {
            job_id,
            status: job.status,
            cancel_requested: job.cancel_requested,
        })
    }
}

/// Periodically expires running jobs whose deadline has passed.
pub struct TimeoutSupervisor {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl TimeoutSupervisor {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "timeout supervisor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("timeout supervisor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
    }

    /// One scan. Returns how many jobs this sweep moved to `expired`; jobs
    /// that finished concurrently are left alone by the status guard.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> AuditResult<usize> {
        let mut expired = 0;
        for job_id in self.store.expired_running(now).await? {
            let patch = JobPatch::finished(now).with_error(EXPIRED_MESSAGE);
            if self
                .store
                .transition(job_id, &[JobStatus::Running], JobStatus::Expired, patch)
                .await?
            {
                warn!(job_id = %job_id, "job expired by timeout supervisor");
                expired += 1;
            }
        }
        Ok(expired)
    }
}
