use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::models::{
    ConflictResponse, HealthResponse, JobView, ListJobsQuery, ListJobsResponse, SubmitResponse,
};
use crate::error::AuditError;
use crate::jobs::model::{JobStatus, SubmitRequest};
use crate::jobs::scheduler::{Scheduler, SchedulerMetrics};
use crate::jobs::supervisor::CancelOutcome;

pub mod models;

pub const REPORT_SHA256_HEADER: &str = "x-report-sha256";

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub version: &'static str,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/report", get(get_report))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuditError::Validation(_) => StatusCode::BAD_REQUEST,
            AuditError::NotFound(_) => StatusCode::NOT_FOUND,
            AuditError::Conflict { .. }
            | AuditError::InvalidStateTransition { .. }
            | AuditError::ReportNotReady { .. } => StatusCode::CONFLICT,
            AuditError::SchedulerOverloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuditError::Executor(_)
            | AuditError::InvalidProgress { .. }
            | AuditError::Database(_)
            | AuditError::Io(_)
            | AuditError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error,
            code: self.code(),
            existing_job_id: match &self {
                AuditError::Conflict { existing_job_id } => Some(*existing_job_id),
                _ => None,
            },
            status: match &self {
                AuditError::InvalidStateTransition { status }
                | AuditError::ReportNotReady { status } => Some(*status),
                _ => None,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<Response, AuditError> {
    let request: SubmitRequest = serde_json::from_value(body)
        .map_err(|e| AuditError::Validation(e.to_string()))?;

    let outcome = state.scheduler.submit(request).await?;
    let job = SubmitResponse::from(&outcome.job);

    if outcome.created {
        return Ok((StatusCode::CREATED, Json(job)).into_response());
    }

    let conflict = AuditError::Conflict {
        existing_job_id: job.job_id,
    };
    Ok((
        StatusCode::CONFLICT,
        Json(ConflictResponse {
            error: conflict.to_string(),
            code: conflict.code(),
            existing_job_id: job.job_id,
            job,
        }),
    )
        .into_response())
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, AuditError> {
    let job = state.scheduler.status(id).await?;
    Ok(Json(JobView::from(job)))
}

pub async fn get_report(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AuditError> {
    let (content, report_ref) = state.scheduler.report(id).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::HeaderName::from_static(REPORT_SHA256_HEADER), report_ref.sha256),
        ],
        content,
    )
        .into_response())
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, AuditError> {
    Ok(Json(state.scheduler.cancel(id).await?))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, AuditError> {
    let status = match q.status.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(s) => Some(
            JobStatus::parse(s)
                .ok_or_else(|| AuditError::Validation(format!("unknown status filter: {s:?}")))?,
        ),
        None => None,
    };

    let jobs = state
        .scheduler
        .list(status, q.limit.unwrap_or(100))
        .await?;

    Ok(Json(ListJobsResponse {
        items: jobs.into_iter().map(JobView::from).collect(),
    }))
}

pub async fn metrics(State(state): State<ApiState>) -> Result<Json<SchedulerMetrics>, AuditError> {
    Ok(Json(state.scheduler.metrics().await?))
}

pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let ok = state.scheduler.health().await;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ok,
            db: if ok { "ready" } else { "error" },
            version: state.version,
        }),
    )
}
