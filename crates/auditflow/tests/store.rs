// tests/store.rs
mod common;

use common::{request, setup_db};

use auditflow::error::AuditError;
use auditflow::jobs::model::{JobPatch, JobStatus, Metrics, Phase, ReportRef};
use auditflow::jobs::store::NewJob;
use auditflow::jobs::{JobStore, JobsRepo, MemoryJobStore};
use chrono::{Duration as ChronoDuration, Utc};
use serial_test::serial;
use std::sync::Arc;

fn new_job(key: Option<&str>, timeout_sec: u64) -> NewJob {
    let (params, idempotency_key) = request(key, timeout_sec).validate().unwrap();
    NewJob {
        params,
        idempotency_key,
        timeout_sec,
    }
}

async fn start(store: &Arc<dyn JobStore>, key: Option<&str>) -> uuid::Uuid {
    let (id, _) = store.create(new_job(key, 30)).await.unwrap();
    assert!(store
        .transition(id, &[JobStatus::Queued], JobStatus::Running, JobPatch::started(Utc::now(), 30))
        .await
        .unwrap());
    id
}

async fn idempotent_create(store: Arc<dyn JobStore>) {
    let mut set = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        set.spawn(async move { store.create(new_job(Some("same-key"), 30)).await.unwrap() });
    }

    let mut results = Vec::new();
    while let Some(r) = set.join_next().await {
        results.push(r.unwrap());
    }
    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
    assert!(results.iter().all(|(id, _)| *id == results[0].0));

    let (other, created) = store.create(new_job(None, 30)).await.unwrap();
    assert!(created);
    assert_ne!(other, results[0].0);

    assert_eq!(
        store.find_by_idempotency_key("same-key").await.unwrap(),
        Some(results[0].0)
    );
    assert_eq!(store.find_by_idempotency_key("other-key").await.unwrap(), None);

    let job = store.get(results[0].0).await.unwrap();
    assert_eq!(job.idempotency_key.as_deref(), Some("same-key"));
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.timeout_sec, 30);
}

async fn guarded_transitions(store: Arc<dyn JobStore>) {
    let (id, _) = store.create(new_job(None, 30)).await.unwrap();

    // wrong expected status is a no-op
    assert!(!store
        .transition(id, &[JobStatus::Running], JobStatus::Failed, JobPatch::finished(Utc::now()))
        .await
        .unwrap());

    let now = Utc::now();
    assert!(store
        .transition(id, &[JobStatus::Queued], JobStatus::Running, JobPatch::started(now, 30))
        .await
        .unwrap());
    let job = store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());
    assert!(job.timeout_deadline.unwrap() > now);

    // two concurrent terminal attempts, exactly one wins
    let a = store.transition(
        id,
        &[JobStatus::Running],
        JobStatus::Expired,
        JobPatch::finished(Utc::now()).with_error("timeout"),
    );
    let b = store.transition(
        id,
        &[JobStatus::Running],
        JobStatus::Succeeded,
        JobPatch::finished(Utc::now()).with_report(ReportRef {
            path: "/tmp/report.txt".into(),
            sha256: "ab".into(),
        }),
    );
    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap() ^ b.unwrap());

    let job = store.get(id).await.unwrap();
    assert!(job.status.is_terminal());
    assert_eq!(job.report_ref.is_some(), job.status == JobStatus::Succeeded);
    assert!(job.finished_at.is_some());

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        store.get(missing).await,
        Err(AuditError::NotFound(x)) if x == missing
    ));
}

async fn progress_and_metrics(store: Arc<dyn JobStore>) {
    let (queued, _) = store.create(new_job(None, 30)).await.unwrap();
    assert!(!store.update_progress(queued, Phase::Fetch, 25).await.unwrap());

    let id = start(&store, None).await;
    assert!(store.update_progress(id, Phase::Fetch, 25).await.unwrap());
    assert!(store.update_progress(id, Phase::Analysis, 25).await.unwrap());

    let err = store.update_progress(id, Phase::Llm, 10).await.unwrap_err();
    assert!(matches!(
        err,
        AuditError::InvalidProgress {
            current: 25,
            attempted: 10
        }
    ));
    let job = store.get(id).await.unwrap();
    assert_eq!(job.progress.phase, Phase::Analysis);
    assert_eq!(job.progress.percent, 25);

    let delta = Metrics {
        calls: 1,
        prompt_tokens: 100,
        completion_tokens: 50,
        elapsed_sec: 1.5,
    };
    assert!(store.merge_metrics(id, delta).await.unwrap());
    assert!(store.merge_metrics(id, delta).await.unwrap());
    let job = store.get(id).await.unwrap();
    assert_eq!(job.metrics.calls, 2);
    assert_eq!(job.metrics.prompt_tokens, 200);
    assert_eq!(job.metrics.completion_tokens, 100);
    assert!((job.metrics.elapsed_sec - 3.0).abs() < 1e-9);

    store
        .transition(id, &[JobStatus::Running], JobStatus::Failed, JobPatch::finished(Utc::now()).with_error("boom"))
        .await
        .unwrap();
    assert!(!store.merge_metrics(id, delta).await.unwrap());
    assert!(!store.update_progress(id, Phase::Final, 100).await.unwrap());
}

async fn cancel_flag_and_scans(store: Arc<dyn JobStore>) {
    let id = start(&store, None).await;
    assert!(store.request_cancel(id).await.unwrap());
    assert!(store.get(id).await.unwrap().cancel_requested);

    let now = Utc::now();
    assert!(store.expired_running(now).await.unwrap().is_empty());
    let later = now + ChronoDuration::seconds(31);
    assert_eq!(store.expired_running(later).await.unwrap(), vec![id]);

    store
        .transition(id, &[JobStatus::Running], JobStatus::Canceled, JobPatch::finished(now).with_error("canceled"))
        .await
        .unwrap();
    assert!(!store.request_cancel(id).await.unwrap());
    assert!(store.expired_running(later).await.unwrap().is_empty());

    let (q1, _) = store.create(new_job(None, 30)).await.unwrap();
    let (q2, _) = store.create(new_job(None, 30)).await.unwrap();
    assert_eq!(store.queued_ids(Utc::now(), 10).await.unwrap(), vec![q1, q2]);
    // jobs created after the cutoff are left out
    let first = store.get(q1).await.unwrap();
    assert_eq!(store.queued_ids(first.created_at, 10).await.unwrap(), vec![q1]);

    let listed = store.list(None, 10).await.unwrap();
    assert_eq!(listed[0].job_id, q2);
    assert_eq!(store.list(Some(JobStatus::Canceled), 10).await.unwrap().len(), 1);
    assert_eq!(store.list(None, 1).await.unwrap().len(), 1);

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.canceled, 1);
    assert_eq!(counts.running, 0);

    store.ping().await.unwrap();
}

fn memory() -> Arc<dyn JobStore> {
    Arc::new(MemoryJobStore::new())
}

#[tokio::test]
async fn memory_idempotent_create() {
    idempotent_create(memory()).await;
}

#[tokio::test]
async fn memory_guarded_transitions() {
    guarded_transitions(memory()).await;
}

#[tokio::test]
async fn memory_progress_and_metrics() {
    progress_and_metrics(memory()).await;
}

#[tokio::test]
async fn memory_cancel_flag_and_scans() {
    cancel_flag_and_scans(memory()).await;
}

async fn postgres() -> Option<Arc<dyn JobStore>> {
    let pool = setup_db().await?;
    Some(Arc::new(JobsRepo::new(pool)))
}

#[tokio::test]
#[serial]
async fn pg_idempotent_create() {
    let Some(store) = postgres().await else { return };
    idempotent_create(store).await;
}

#[tokio::test]
#[serial]
async fn pg_guarded_transitions() {
    let Some(store) = postgres().await else { return };
    guarded_transitions(store).await;
}

#[tokio::test]
#[serial]
async fn pg_progress_and_metrics() {
    let Some(store) = postgres().await else { return };
    progress_and_metrics(store).await;
}

#[tokio::test]
#[serial]
async fn pg_cancel_flag_and_scans() {
    let Some(store) = postgres().await else { return };
    cancel_flag_and_scans(store).await;
}
