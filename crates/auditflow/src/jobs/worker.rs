use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::executor::{AuditExecutor, PhaseContext};
use crate::jobs::model::{Job, JobPatch, JobStatus, Phase, Progress};
use crate::jobs::report::ReportSink;
use crate::jobs::store::JobStore;
use crate::jobs::supervisor::{CANCELED_MESSAGE, EXPIRED_MESSAGE};

/// What a worker found at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Continue,
    Stop,
}

/// Shared by every worker of one scheduler.
pub(crate) struct Worker {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) executor: Arc<dyn AuditExecutor>,
    pub(crate) sink: Arc<dyn ReportSink>,
    pub(crate) verbose_job_logs: bool,
}

impl Worker {
    /// Pull ids until shutdown. Errors on one job never stop the loop.
    pub(crate) async fn run(
        self: Arc<Self>,
        worker_id: usize,
        queue: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) {
        debug!(worker_id, "worker started");
        while let Some(job_id) = queue.next(&shutdown).await {
            if let Err(e) = self.process(job_id).await {
                if !matches!(e, AuditError::Executor(_)) {
                    error!(worker_id, job_id = %job_id, error = %e, "job processing failed");
                }
                self.fail(job_id, &e).await;
            }
        }
        debug!(worker_id, "worker stopped");
    }

    pub(crate) async fn process(&self, job_id: Uuid) -> AuditResult<()> {
        let job = self.store.get(job_id).await?;
        let started = JobPatch::started(Utc::now(), job.timeout_sec);
        if !self
            .store
            .transition(job_id, &[JobStatus::Queued], JobStatus::Running, started)
            .await?
        {
            debug!(job_id = %job_id, status = %job.status, "job no longer queued, skipping");
            return Ok(());
        }
        if self.verbose_job_logs {
            info!(job_id = %job_id, profile = %job.params.audit_profile, "job started");
        }

        let mut context = PhaseContext::new(job_id);
        let mut percent = 0u8;

        for phase in Phase::SEQUENCE {
            if self.checkpoint(job_id, phase).await? == Checkpoint::Stop {
                return Ok(());
            }
            // pollers see the phase currently executing
            self.record_progress(job_id, phase, percent).await?;
            self.log_phase(job_id, phase, "phase started");

            let clock = Instant::now();
            let mut outcome = match self.executor.run_phase(phase, &job.params, &context).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(job_id = %job_id, phase = %phase, code = e.code, error = %e, "executor failed");
                    return Err(e.into());
                }
            };
            outcome.metrics.elapsed_sec = clock.elapsed().as_secs_f64();

            if !self.store.merge_metrics(job_id, outcome.metrics).await? {
                debug!(job_id = %job_id, phase = %phase, "job left running during phase");
                return Ok(());
            }
            let target = outcome
                .percent
                .unwrap_or_else(|| phase.completion_percent())
                .min(100);
            if self.record_progress(job_id, phase, target).await? {
                percent = percent.max(target);
            }
            context.record(phase, &outcome);
            self.log_phase(job_id, phase, "phase finished");
        }

        self.finish(&job, context).await
    }

    /// Best-effort `running -> failed` carrying the cause. Executor messages
    /// are recorded verbatim; anything else is prefixed `job aborted:`.
    async fn fail(&self, job_id: Uuid, cause: &AuditError) {
        let message = match cause {
            AuditError::Executor(e) => e.message.clone(),
            other => format!("job aborted: {other}"),
        };
        let patch = JobPatch::finished(Utc::now()).with_error(message);
        match self
            .store
            .transition(job_id, &[JobStatus::Running], JobStatus::Failed, patch)
            .await
        {
            Ok(true) => debug!(job_id = %job_id, code = cause.code(), "job marked failed"),
            Ok(false) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "could not mark job failed"),
        }
    }

    /// Persist the report and move the job to `succeeded`.
    async fn finish(&self, job: &Job, context: PhaseContext) -> AuditResult<()> {
        let job_id = job.job_id;
        let current = self.store.get(job_id).await?;
        if current.status != JobStatus::Running {
            debug!(job_id = %job_id, status = %current.status, "job left running before report");
            return Ok(());
        }

        let content = context.into_report();
        let report_ref = match self.sink.write(job_id, &content).await {
            Ok(r) => r,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "report persistence failed");
                let patch = JobPatch::finished(Utc::now())
                    .with_error(format!("report persistence failed: {e}"));
                self.store
                    .transition(job_id, &[JobStatus::Running], JobStatus::Failed, patch)
                    .await?;
                return Ok(());
            }
        };

        let patch = JobPatch::finished(Utc::now())
            .with_progress(Progress {
                phase: Phase::Final,
                percent: 100,
            })
            .with_report(report_ref);
        if self
            .store
            .transition(job_id, &[JobStatus::Running], JobStatus::Succeeded, patch)
            .await?
        {
            info!(job_id = %job_id, "job succeeded");
        } else {
            debug!(job_id = %job_id, "job reached a terminal state before success was recorded");
        }
        Ok(())
    }

    async fn checkpoint(&self, job_id: Uuid, phase: Phase) -> AuditResult<Checkpoint> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Running {
            debug!(job_id = %job_id, status = %job.status, "job left running, stopping");
            return Ok(Checkpoint::Stop);
        }

        if job.cancel_requested {
            let patch = JobPatch::finished(Utc::now()).with_error(CANCELED_MESSAGE);
            if self
                .store
                .transition(job_id, &[JobStatus::Running], JobStatus::Canceled, patch)
                .await?
            {
                info!(job_id = %job_id, before = %phase, "job canceled at checkpoint");
            }
            return Ok(Checkpoint::Stop);
        }

        if job.deadline_passed(Utc::now()) {
            let patch = JobPatch::finished(Utc::now()).with_error(EXPIRED_MESSAGE);
            if self
                .store
                .transition(job_id, &[JobStatus::Running], JobStatus::Expired, patch)
                .await?
            {
                warn!(job_id = %job_id, before = %phase, "job expired at checkpoint");
            }
            return Ok(Checkpoint::Stop);
        }

        Ok(Checkpoint::Continue)
    }

    /// A decreasing percent is logged and dropped; the job keeps the
    /// higher recorded value.
    async fn record_progress(&self, job_id: Uuid, phase: Phase, percent: u8) -> AuditResult<bool> {
        match self.store.update_progress(job_id, phase, percent).await {
            Ok(applied) => Ok(applied),
            Err(AuditError::InvalidProgress { current, attempted }) => {
                warn!(job_id = %job_id, phase = %phase, current, attempted, "ignoring decreasing progress");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn log_phase(&self, job_id: Uuid, phase: Phase, msg: &str) {
        if self.verbose_job_logs {
            info!(job_id = %job_id, phase = %phase, "{msg}");
        } else {
            debug!(job_id = %job_id, phase = %phase, "{msg}");
        }
    }
}
