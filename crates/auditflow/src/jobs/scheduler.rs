use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::executor::AuditExecutor;
use crate::jobs::model::{Job, JobStatus, ReportRef, StatusCounts, SubmitRequest};
use crate::jobs::report::ReportSink;
use crate::jobs::store::{JobStore, NewJob};
use crate::jobs::supervisor::{CancelOutcome, CancelSupervisor, TimeoutSupervisor};
use crate::jobs::worker::Worker;

// recovery re-feeds at most this many queued jobs per start
const RECOVERY_LIMIT: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_pool_size: usize,
    /// Queue capacity is `worker_pool_size * queue_multiplier`.
    pub queue_multiplier: usize,
    /// Upper bound applied to every job's requested timeout.
    pub hard_timeout_sec: u64,
    pub timeout_scan_interval: Duration,
    pub verbose_job_logs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            queue_multiplier: 4,
            hard_timeout_sec: 1200,
            timeout_scan_interval: Duration::from_secs(2),
            verbose_job_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub job: Job,
    /// False when the idempotency key already pointed at `job`.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub jobs: StatusCounts,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: usize,
}

/// Owns the job lifecycle for one process: store, dispatcher, worker pool,
/// report sink and both supervisors.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    worker: Arc<Worker>,
    sink: Arc<dyn ReportSink>,
    cancel_supervisor: CancelSupervisor,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Queued jobs created after this instant were dispatched by `submit`;
    /// startup recovery only re-feeds older ones.
    recovery_cutoff: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn AuditExecutor>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::for_pool(
            config.worker_pool_size,
            config.queue_multiplier,
        ));
        let worker = Arc::new(Worker {
            store: store.clone(),
            executor,
            sink: sink.clone(),
            verbose_job_logs: config.verbose_job_logs,
        });

        Self {
            cancel_supervisor: CancelSupervisor::new(store.clone()),
            config,
            store,
            dispatcher,
            worker,
            sink,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            recovery_cutoff: Utc::now(),
        }
    }

    /// Spawn the worker pool and the timeout supervisor, then re-feed jobs
    /// left `queued` from before this scheduler existed. Running jobs are
    /// not requeued.
    pub fn start(&self) -> AuditResult<()> {
        let mut tasks = self.lock_tasks()?;
        if !tasks.is_empty() {
            return Err(AuditError::Internal("scheduler already started".into()));
        }
        if self.shutdown.is_cancelled() {
            return Err(AuditError::Internal("scheduler was stopped".into()));
        }

        let workers = self.config.worker_pool_size.max(1);
        for worker_id in 0..workers {
            let worker = self.worker.clone();
            let queue = self.dispatcher.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(worker.run(worker_id, queue, shutdown)));
        }

        let timeouts = TimeoutSupervisor::new(self.store.clone(), self.config.timeout_scan_interval);
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { timeouts.run(shutdown).await }));

        let store = self.store.clone();
        let queue = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let cutoff = self.recovery_cutoff;
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                res = recover_queued(store, queue, cutoff) => {
                    if let Err(e) = res {
                        error!(error = %e, "startup recovery failed");
                    }
                }
            }
        }));

        info!(
            workers,
            queue_capacity = self.dispatcher.capacity(),
            hard_timeout_sec = self.config.hard_timeout_sec,
            "scheduler started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for every background task. In-flight phases
    /// run to completion; their jobs stay `running` until expired.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = match self.lock_tasks() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(e) => {
                error!(error = %e, "cannot collect scheduler tasks");
                return;
            }
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Validate, resolve the idempotency key, persist a queued job and hand
    /// it to the pool. A known key returns its job even when the queue is
    /// full; a new job is rejected on a full queue before anything is written.
    pub async fn submit(&self, request: SubmitRequest) -> AuditResult<SubmitOutcome> {
        let (params, idempotency_key) = request.validate()?;
        let timeout_sec = params.timeout_sec.min(self.config.hard_timeout_sec).max(1);

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(job_id) = self.store.find_by_idempotency_key(key).await? {
                info!(job_id = %job_id, "idempotency key reused, returning existing job");
                let job = self.store.get(job_id).await?;
                return Ok(SubmitOutcome { job, created: false });
            }
        }

        // a concurrent submit with the same key can still win between the
        // lookup and create; create then reports created = false
        let slot = self.dispatcher.reserve()?;
        let (job_id, created) = self
            .store
            .create(NewJob {
                params,
                idempotency_key,
                timeout_sec,
            })
            .await?;

        if created {
            slot.send(job_id);
            info!(job_id = %job_id, timeout_sec, "job queued");
        } else {
            drop(slot);
            info!(job_id = %job_id, "idempotency key reused, returning existing job");
        }

        let job = self.store.get(job_id).await?;
        Ok(SubmitOutcome { job, created })
    }

    pub async fn status(&self, job_id: Uuid) -> AuditResult<Job> {
        self.store.get(job_id).await
    }

    /// Report content and its reference; only available once succeeded.
    pub async fn report(&self, job_id: Uuid) -> AuditResult<(String, ReportRef)> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Succeeded {
            return Err(AuditError::ReportNotReady { status: job.status });
        }
        let report_ref = job.report_ref.ok_or_else(|| {
            AuditError::Internal(format!("succeeded job {job_id} has no report reference"))
        })?;
        let content = self.sink.read(&report_ref).await?;
        Ok((content, report_ref))
    }

    pub async fn cancel(&self, job_id: Uuid) -> AuditResult<CancelOutcome> {
        self.cancel_supervisor.cancel(job_id).await
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> AuditResult<Vec<Job>> {
        self.store.list(status, limit).await
    }

    pub async fn metrics(&self) -> AuditResult<SchedulerMetrics> {
        Ok(SchedulerMetrics {
            jobs: self.store.status_counts().await?,
            queue_depth: self.dispatcher.depth(),
            queue_capacity: self.dispatcher.capacity(),
            workers: self.config.worker_pool_size.max(1),
        })
    }

    /// True when the store answers.
    pub async fn health(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store health check failed");
                false
            }
        }
    }

    fn lock_tasks(&self) -> AuditResult<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.tasks
            .lock()
            .map_err(|_| AuditError::Internal("scheduler task list poisoned".into()))
    }
}

async fn recover_queued(
    store: Arc<dyn JobStore>,
    queue: Arc<Dispatcher>,
    cutoff: DateTime<Utc>,
) -> AuditResult<()> {
    let ids = store.queued_ids(cutoff, RECOVERY_LIMIT).await?;
    if ids.is_empty() {
        return Ok(());
    }
    info!(count = ids.len(), "re-dispatching queued jobs");
    for job_id in ids {
        queue.enqueue(job_id).await?;
    }
    Ok(())
}
