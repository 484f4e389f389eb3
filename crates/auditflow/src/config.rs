use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::executor::ExecutorKind;
use crate::jobs::scheduler::SchedulerConfig;

/// Runtime configuration, loaded from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub worker_pool_size: usize,
    pub queue_multiplier: usize,
    pub job_hard_timeout_sec: u64,
    pub timeout_scan_interval_ms: u64,
    pub data_dir: PathBuf,
    pub addr: Option<String>,
    pub migrate_on_startup: bool,
    pub verbose_job_logs: bool,
    pub executor: ExecutorKind,
    pub dry_run_phase_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("AUDITFLOW_DATABASE_URL", "DATABASE_URL");

        let worker_pool_size = env_or_fallback("AUDITFLOW_WORKER_POOL_SIZE", "WORKER_POOL_SIZE")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4)
            .max(1);

        let queue_multiplier = env_parse("AUDITFLOW_QUEUE_MULTIPLIER")
            .unwrap_or(4usize)
            .max(1);

        let job_hard_timeout_sec =
            env_or_fallback("AUDITFLOW_JOB_HARD_TIMEOUT_SEC", "JOB_HARD_TIMEOUT_SEC")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1200)
                .max(1);

        let timeout_scan_interval_ms = env_parse("AUDITFLOW_TIMEOUT_SCAN_INTERVAL_MS")
            .unwrap_or(2000u64)
            .clamp(10, 60_000);

        let data_dir: PathBuf = env_or_fallback("AUDITFLOW_DATA_DIR", "DATA_DIR")
            .unwrap_or_else(|| "./data".to_string())
            .into();

        let addr = match env_or_fallback("AUDITFLOW_ADDR", "ADDR") {
            Some(v) => normalize_optional_addr(&v),
            None => Some("0.0.0.0:8080".to_string()),
        };

        let migrate_on_startup = env_bool("AUDITFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);
        let verbose_job_logs = env_bool("AUDITFLOW_VERBOSE_JOB_LOGS").unwrap_or(false);

        let executor = match std::env::var("AUDITFLOW_EXECUTOR") {
            Ok(v) if !v.trim().is_empty() => ExecutorKind::parse(&v)
                .ok_or_else(|| anyhow::anyhow!("AUDITFLOW_EXECUTOR has unknown value {v:?}"))?,
            _ => ExecutorKind::DryRun,
        };

        let dry_run_phase_delay_ms = env_parse("AUDITFLOW_DRY_RUN_PHASE_DELAY_MS").unwrap_or(500u64);

        Ok(Self {
            database_url,
            worker_pool_size,
            queue_multiplier,
            job_hard_timeout_sec,
            timeout_scan_interval_ms,
            data_dir,
            addr,
            migrate_on_startup,
            verbose_job_logs,
            executor,
            dry_run_phase_delay_ms,
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_pool_size: self.worker_pool_size,
            queue_multiplier: self.queue_multiplier,
            hard_timeout_sec: self.job_hard_timeout_sec,
            timeout_scan_interval: Duration::from_millis(self.timeout_scan_interval_ms),
            verbose_job_logs: self.verbose_job_logs,
        }
    }

    pub fn dry_run_phase_delay(&self) -> Duration {
        Duration::from_millis(self.dry_run_phase_delay_ms)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
