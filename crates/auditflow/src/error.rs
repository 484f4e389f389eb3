use uuid::Uuid;

use crate::jobs::executor::ExecutorError;
use crate::jobs::model::JobStatus;

/// Error taxonomy of the job lifecycle core.
///
/// Lookup and validation failures surface synchronously to the caller.
/// Execution-time failures are recorded on the job instead and only show up
/// through status polls.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Malformed submission, rejected before any job is created.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The idempotency key already maps to a job.
    #[error("idempotency key already used by job {existing_job_id}")]
    Conflict { existing_job_id: Uuid },

    /// The requested edge is not allowed from the job's current status.
    #[error("invalid state transition: job is {status}")]
    InvalidStateTransition { status: JobStatus },

    #[error("report not ready: job is {status}")]
    ReportNotReady { status: JobStatus },

    /// The dispatch queue is at capacity; the caller should retry later.
    #[error("scheduler overloaded: dispatch queue is full (capacity {capacity})")]
    SchedulerOverloaded { capacity: usize },

    /// An executor phase failed; the message is recorded on the job as-is.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A progress update tried to lower the recorded percent.
    #[error("invalid progress: percent {attempted} is below current {current}")]
    InvalidProgress { current: u8, attempted: u8 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    /// Idempotency collisions and rejected cancels are both conflict-class.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AuditError::Conflict { .. } | AuditError::InvalidStateTransition { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuditError::Validation(_) => "VALIDATION_ERROR",
            AuditError::NotFound(_) => "NOT_FOUND",
            AuditError::Conflict { .. } => "CONFLICT",
            AuditError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            AuditError::ReportNotReady { .. } => "REPORT_NOT_READY",
            AuditError::SchedulerOverloaded { .. } => "SCHEDULER_OVERLOADED",
            AuditError::Executor(_) => "EXECUTOR_ERROR",
            AuditError::InvalidProgress { .. } => "INVALID_PROGRESS",
            AuditError::Database(_) => "DATABASE_ERROR",
            AuditError::Io(_) => "IO_ERROR",
            AuditError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
