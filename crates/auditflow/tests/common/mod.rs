#![allow(dead_code)]

use async_trait::async_trait;
use auditflow::error::{AuditError, AuditResult};
use auditflow::jobs::executor::{AuditExecutor, ExecutorError, PhaseContext, PhaseOutcome};
use auditflow::jobs::model::{
    AuditParams, Job, JobPatch, JobStatus, Metrics, Phase, StatusCounts, SubmitRequest,
};
use auditflow::jobs::store::NewJob;
use auditflow::jobs::{FsReportSink, JobStore, MemoryJobStore, Scheduler, SchedulerConfig};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// `None` when TEST_DATABASE_URL is unset; callers skip the test.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE idempotency_keys, audit_jobs CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn request(idempotency_key: Option<&str>, timeout_sec: u64) -> SubmitRequest {
    serde_json::from_value(json!({
        "source": { "type": "inline", "inline_code": "contract Token { function transfer() {} }" },
        "audit_profile": "erc20_basic",
        "timeout_sec": timeout_sec,
        "idempotency_key": idempotency_key,
    }))
    .expect("valid request")
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_pool_size: 2,
        queue_multiplier: 4,
        hard_timeout_sec: 1200,
        timeout_scan_interval: Duration::from_millis(50),
        verbose_job_logs: true,
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub dir: tempfile::TempDir,
}

pub fn harness(config: SchedulerConfig, executor: ScriptedExecutor) -> Harness {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    harness_with_store(config, executor, store)
}

pub fn harness_with_store(
    config: SchedulerConfig,
    executor: ScriptedExecutor,
    store: Arc<dyn JobStore>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Arc::new(executor);
    let scheduler = Arc::new(Scheduler::new(
        config,
        store.clone(),
        executor.clone(),
        Arc::new(FsReportSink::new(dir.path())),
    ));
    Harness {
        scheduler,
        store,
        executor,
        dir,
    }
}

pub async fn wait_for<F>(store: &Arc<dyn JobStore>, id: Uuid, within: Duration, pred: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = store.get(id).await.expect("job exists");
        if pred(&job) {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {within:?}; last state: {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(store: &Arc<dyn JobStore>, id: Uuid, within: Duration) -> Job {
    wait_for(store, id, within, |j| j.status.is_terminal()).await
}

pub fn expected_report(job_id: Uuid) -> String {
    format!("report for {job_id}")
}

/// Executor whose behaviour is configured per phase.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<(Uuid, Phase)>>,
    delay: Duration,
    sleep_on: Option<(Phase, Duration)>,
    fail_on: Option<(Phase, String)>,
    gate_on: Option<Phase>,
    percents: HashMap<Phase, u8>,
    /// Notified when a job reaches the gated phase.
    pub entered: Notify,
    /// Notify to let the gated phase finish.
    pub release: Notify,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.delay = d;
        self
    }

    pub fn sleep_on(mut self, phase: Phase, d: Duration) -> Self {
        self.sleep_on = Some((phase, d));
        self
    }

    pub fn fail_on(mut self, phase: Phase, message: &str) -> Self {
        self.fail_on = Some((phase, message.to_string()));
        self
    }

    pub fn gate_on(mut self, phase: Phase) -> Self {
        self.gate_on = Some(phase);
        self
    }

    pub fn percent(mut self, phase: Phase, percent: u8) -> Self {
        self.percents.insert(phase, percent);
        self
    }

    pub fn calls(&self) -> Vec<(Uuid, Phase)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn phases_for(&self, job_id: Uuid) -> Vec<Phase> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, p)| p)
            .collect()
    }
}

#[async_trait]
impl AuditExecutor for ScriptedExecutor {
    async fn run_phase(
        &self,
        phase: Phase,
        _params: &AuditParams,
        context: &PhaseContext,
    ) -> Result<PhaseOutcome, ExecutorError> {
        self.calls.lock().unwrap().push((context.job_id, phase));

        if self.gate_on == Some(phase) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((p, d)) = self.sleep_on {
            if p == phase {
                tokio::time::sleep(d).await;
            }
        }
        if let Some((p, msg)) = &self.fail_on {
            if *p == phase {
                return Err(ExecutorError::new("SCRIPTED", msg.clone()));
            }
        }

        let mut outcome = PhaseOutcome::with_output(json!({ "phase": phase.as_str() }));
        outcome.percent = self.percents.get(&phase).copied();
        if phase == Phase::Llm {
            outcome.metrics = Metrics {
                calls: 1,
                prompt_tokens: 10,
                completion_tokens: 20,
                elapsed_sec: 0.0,
            };
            outcome.artifact = Some(expected_report(context.job_id));
        }
        Ok(outcome)
    }
}

pub fn is_status(status: JobStatus) -> impl Fn(&Job) -> bool {
    move |j| j.status == status
}

/// Memory store whose `merge_metrics` fails while `fail_metrics` is set.
#[derive(Default)]
pub struct FailingMetricsStore {
    inner: MemoryJobStore,
    pub fail_metrics: AtomicBool,
}

impl FailingMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for FailingMetricsStore {
    async fn create(&self, new: NewJob) -> AuditResult<(Uuid, bool)> {
        self.inner.create(new).await
    }

    async fn get(&self, job_id: Uuid) -> AuditResult<Job> {
        self.inner.get(job_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AuditResult<Option<Uuid>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        expected: &[JobStatus],
        new_status: JobStatus,
        patch: JobPatch,
    ) -> AuditResult<bool> {
        self.inner.transition(job_id, expected, new_status, patch).await
    }

    async fn update_progress(&self, job_id: Uuid, phase: Phase, percent: u8) -> AuditResult<bool> {
        self.inner.update_progress(job_id, phase, percent).await
    }

    async fn merge_metrics(&self, job_id: Uuid, delta: Metrics) -> AuditResult<bool> {
        if self.fail_metrics.load(Ordering::SeqCst) {
            return Err(AuditError::Internal("metrics write rejected".into()));
        }
        self.inner.merge_metrics(job_id, delta).await
    }

    async fn request_cancel(&self, job_id: Uuid) -> AuditResult<bool> {
        self.inner.request_cancel(job_id).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> AuditResult<Vec<Job>> {
        self.inner.list(status, limit).await
    }

    async fn queued_ids(&self, created_before: DateTime<Utc>, limit: i64) -> AuditResult<Vec<Uuid>> {
        self.inner.queued_ids(created_before, limit).await
    }

    async fn expired_running(&self, now: DateTime<Utc>) -> AuditResult<Vec<Uuid>> {
        self.inner.expired_running(now).await
    }

    async fn status_counts(&self) -> AuditResult<StatusCounts> {
        self.inner.status_counts().await
    }

    async fn ping(&self) -> AuditResult<()> {
        self.inner.ping().await
    }
}
