use auditflow::api;
use auditflow::config::Config;
use auditflow::db;
use auditflow::jobs::{FsReportSink, JobStore, JobsRepo, MemoryJobStore, Scheduler};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auditflow=info,worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        workers = cfg.worker_pool_size,
        queue_multiplier = cfg.queue_multiplier,
        hard_timeout_sec = cfg.job_hard_timeout_sec,
        data_dir = %cfg.data_dir.display(),
        api = cfg.addr.as_deref().unwrap_or("disabled"),
        store = if cfg.database_url.is_some() { "postgres" } else { "memory" },
        executor = ?cfg.executor,
        "auditflow starting"
    );

    let store: Arc<dyn JobStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(JobsRepo::new(pool))
        }
        None => {
            tracing::warn!("no database configured, jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    tokio::fs::create_dir_all(&cfg.data_dir).await?;
    let sink = Arc::new(FsReportSink::new(cfg.data_dir.clone()));
    let executor = cfg.executor.build(cfg.dry_run_phase_delay());

    let scheduler = Arc::new(Scheduler::new(cfg.scheduler(), store, executor, sink));
    scheduler.start()?;

    let app = api::router(api::ApiState {
        scheduler: scheduler.clone(),
        version: env!("CARGO_PKG_VERSION"),
    });

    let api_addr = cfg.addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let result = tokio::select! {
        res = api_handle => res.map_err(anyhow::Error::from).and_then(|r| r),
        res = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            res.map_err(anyhow::Error::from)
        }
    };

    scheduler.stop().await;
    result
}
