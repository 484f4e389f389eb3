// crates/auditflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::model::{
    AuditParams, Job, JobPatch, JobStatus, Metrics, Phase, Progress, ReportRef, StatusCounts,
};
use crate::jobs::store::{check_transition, clamp_limit, JobStore, NewJob};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    idempotency_key: Option<String>,
    params_json: Value,
    status: String,

    progress_phase: String,
    progress_percent: i16,

    calls: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
    elapsed_sec: f64,

    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,

    error_message: Option<String>,
    cancel_requested: bool,
    timeout_sec: i64,
    timeout_deadline: Option<DateTime<Utc>>,

    report_path: Option<String>,
    report_sha256: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = AuditError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| AuditError::Internal(format!("unknown job status {:?}", row.status)))?;
        let phase = Phase::parse(&row.progress_phase).ok_or_else(|| {
            AuditError::Internal(format!("unknown progress phase {:?}", row.progress_phase))
        })?;
        let params: AuditParams = serde_json::from_value(row.params_json)
            .map_err(|e| AuditError::Internal(format!("corrupt params_json: {e}")))?;

        let report_ref = match (row.report_path, row.report_sha256) {
            (Some(path), Some(sha256)) => Some(ReportRef { path, sha256 }),
            _ => None,
        };

        Ok(Job {
            job_id: row.id,
            idempotency_key: row.idempotency_key,
            params,
            status,
            progress: Progress {
                phase,
                percent: row.progress_percent.clamp(0, 100) as u8,
            },
            metrics: Metrics {
                calls: row.calls.max(0) as u64,
                prompt_tokens: row.prompt_tokens.max(0) as u64,
                completion_tokens: row.completion_tokens.max(0) as u64,
                elapsed_sec: row.elapsed_sec,
            },
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            cancel_requested: row.cancel_requested,
            timeout_sec: row.timeout_sec.max(0) as u64,
            timeout_deadline: row.timeout_deadline,
            report_ref,
        })
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, job_id: Uuid) -> AuditResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM audit_jobs WHERE id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Distinguish "guard did not match" from "no such job".
    async fn not_applied(&self, job_id: Uuid) -> AuditResult<bool> {
        if self.exists(job_id).await? {
            Ok(false)
        } else {
            Err(AuditError::NotFound(job_id))
        }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    // ----------------------------
    // Create (idempotency index + job row in one transaction)
    // ----------------------------

    async fn create(&self, new: NewJob) -> AuditResult<(Uuid, bool)> {
        let params_json = serde_json::to_value(&new.params)
            .map_err(|e| AuditError::Internal(format!("params not serializable: {e}")))?;
        let job_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        if let Some(key) = new.idempotency_key.as_deref() {
            // Concurrent inserts of the same key serialize on the primary key;
            // the loser sees DO NOTHING and reads the winner's mapping.
            let claimed: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO idempotency_keys (key, job_id)
                VALUES ($1, $2)
                ON CONFLICT (key) DO NOTHING
                RETURNING job_id
                "#,
            )
            .bind(key)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;

            if claimed.is_none() {
                let existing: Uuid =
                    sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE key = $1")
                        .bind(key)
                        .fetch_one(&mut *tx)
                        .await?;
                tx.rollback().await?;
                return Ok((existing, false));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO audit_jobs (id, idempotency_key, params_json, status, timeout_sec, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job_id)
        .bind(new.idempotency_key.as_deref())
        .bind(params_json)
        .bind(JobStatus::Queued.as_str())
        .bind(to_i64(new.timeout_sec))
        // same clock as the scheduler recovery cutoff
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((job_id, true))
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn find_by_idempotency_key(&self, key: &str) -> AuditResult<Option<Uuid>> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn get(&self, job_id: Uuid) -> AuditResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM audit_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(AuditError::NotFound(job_id)),
        }
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> AuditResult<Vec<Job>> {
        let limit = clamp_limit(limit) as i64;

        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT *
                    FROM audit_jobs
                    WHERE status = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(st.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT *
                    FROM audit_jobs
                    ORDER BY created_at DESC, id DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn queued_ids(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AuditResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM audit_jobs
            WHERE status = 'queued'
              AND created_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn expired_running(&self, now: DateTime<Utc>) -> AuditResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM audit_jobs
            WHERE status = 'running'
              AND timeout_deadline IS NOT NULL
              AND timeout_deadline <= $1
            ORDER BY timeout_deadline ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn status_counts(&self) -> AuditResult<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM audit_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            if let Some(status) = JobStatus::parse(&status) {
                counts.add(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> AuditResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn transition(
        &self,
        job_id: Uuid,
        expected: &[JobStatus],
        new_status: JobStatus,
        patch: JobPatch,
    ) -> AuditResult<bool> {
        check_transition(expected, new_status, &patch)?;

        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let metrics = patch.metrics.unwrap_or_default();
        let elapsed = if metrics.elapsed_sec.is_finite() {
            metrics.elapsed_sec.max(0.0)
        } else {
            0.0
        };
        let (report_path, report_sha256) = match patch.report_ref {
            Some(r) => (Some(r.path), Some(r.sha256)),
            None => (None, None),
        };

        // Right-hand sides see the pre-update row, so the progress guard
        // compares against the stored percent.
        let res = sqlx::query(
            r#"
            UPDATE audit_jobs
            SET status = $3,
                started_at = COALESCE(started_at, $4),
                finished_at = COALESCE($5, finished_at),
                timeout_deadline = COALESCE($6, timeout_deadline),
                error_message = COALESCE($7, error_message),
                progress_phase = CASE
                    WHEN $9::smallint IS NOT NULL AND $9::smallint >= progress_percent THEN $8
                    ELSE progress_phase
                END,
                progress_percent = GREATEST(progress_percent, COALESCE($9::smallint, progress_percent)),
                calls = calls + $10,
                prompt_tokens = prompt_tokens + $11,
                completion_tokens = completion_tokens + $12,
                elapsed_sec = elapsed_sec + $13,
                report_path = COALESCE($14, report_path),
                report_sha256 = COALESCE($15, report_sha256),
                updated_at = now()
            WHERE id = $1
              AND status = ANY($2)
            "#,
        )
        .bind(job_id)
        .bind(expected)
        .bind(new_status.as_str())
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(patch.timeout_deadline)
        .bind(patch.error_message)
        .bind(patch.progress.map(|p| p.phase.as_str()))
        .bind(patch.progress.map(|p| i16::from(p.percent.min(100))))
        .bind(to_i64(metrics.calls))
        .bind(to_i64(metrics.prompt_tokens))
        .bind(to_i64(metrics.completion_tokens))
        .bind(elapsed)
        .bind(report_path)
        .bind(report_sha256)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }
        self.not_applied(job_id).await
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        phase: Phase,
        percent: u8,
    ) -> AuditResult<bool> {
        let percent = i16::from(percent.min(100));

        let res = sqlx::query(
            r#"
            UPDATE audit_jobs
            SET progress_phase = $2,
                progress_percent = $3,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND progress_percent <= $3
            "#,
        )
        .bind(job_id)
        .bind(phase.as_str())
        .bind(percent)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }

        let current = sqlx::query_as::<_, (String, i16)>(
            "SELECT status, progress_percent FROM audit_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Err(AuditError::NotFound(job_id)),
            Some((status, _)) if status != JobStatus::Running.as_str() => Ok(false),
            Some((_, current)) => Err(AuditError::InvalidProgress {
                current: current.clamp(0, 100) as u8,
                attempted: percent as u8,
            }),
        }
    }

    async fn merge_metrics(&self, job_id: Uuid, delta: Metrics) -> AuditResult<bool> {
        let elapsed = if delta.elapsed_sec.is_finite() {
            delta.elapsed_sec.max(0.0)
        } else {
            0.0
        };

        let res = sqlx::query(
            r#"
            UPDATE audit_jobs
            SET calls = calls + $2,
                prompt_tokens = prompt_tokens + $3,
                completion_tokens = completion_tokens + $4,
                elapsed_sec = elapsed_sec + $5,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(to_i64(delta.calls))
        .bind(to_i64(delta.prompt_tokens))
        .bind(to_i64(delta.completion_tokens))
        .bind(elapsed)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }
        self.not_applied(job_id).await
    }

    async fn request_cancel(&self, job_id: Uuid) -> AuditResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE audit_jobs
            SET cancel_requested = TRUE,
                updated_at = now()
            WHERE id = $1
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }
        self.not_applied(job_id).await
    }
}
