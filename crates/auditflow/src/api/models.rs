use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{Job, JobLinks, JobStatus, Metrics, Progress};

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub links: JobLinks,
}

impl From<&Job> for SubmitResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            created_at: job.created_at,
            links: job.links(),
        }
    }
}

/// Returned with 409 when the idempotency key already names a job.
#[derive(Debug, Serialize)]
pub struct ConflictResponse {
    pub error: String,
    pub code: &'static str,
    pub existing_job_id: Uuid,
    pub job: SubmitResponse,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: Progress,
    pub metrics: Metrics,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeout_deadline: Option<DateTime<Utc>>,
    pub links: JobLinks,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let links = job.links();
        Self {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress,
            metrics: job.metrics,
            error_message: job.error_message,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            timeout_deadline: job.timeout_deadline,
            links,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobView>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub db: &'static str,
    pub version: &'static str,
}
