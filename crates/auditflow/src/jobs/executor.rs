//! Interface to the collaborator that actually performs an audit.
//!
//! The core only sequences phases and records their results; what a phase
//! does (fetching sources, running tools, calling a model) lives behind
//! [`AuditExecutor`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::dry_run::DryRunExecutor;
use crate::jobs::model::{AuditParams, Metrics, Phase};

/// Failure reported by an executor. The message is recorded verbatim as the
/// job's `error_message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub code: &'static str,
    pub message: String,
}

impl ExecutorError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// What a single phase hands back to the core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    /// Added to the job's accumulated metrics.
    pub metrics: Metrics,
    /// Stored in the context under the phase name for later phases.
    pub output: Value,
    /// Report content; the latest artifact produced becomes the job's report.
    pub artifact: Option<String>,
    /// Overrides the phase's default completion percent.
    pub percent: Option<u8>,
}

impl PhaseOutcome {
    pub fn with_output(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Outputs accumulated across the phases of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseContext {
    pub job_id: Uuid,
    pub outputs: Map<String, Value>,
    pub artifact: Option<String>,
}

impl PhaseContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            outputs: Map::new(),
            artifact: None,
        }
    }

    pub fn output(&self, phase: Phase) -> Option<&Value> {
        self.outputs.get(phase.as_str())
    }

    pub fn record(&mut self, phase: Phase, outcome: &PhaseOutcome) {
        self.outputs
            .insert(phase.as_str().to_string(), outcome.output.clone());
        if let Some(artifact) = &outcome.artifact {
            self.artifact = Some(artifact.clone());
        }
    }

    /// Report content once every phase ran: the latest artifact, or the
    /// accumulated phase outputs rendered as JSON.
    pub fn into_report(self) -> String {
        match self.artifact {
            Some(artifact) => artifact,
            None => serde_json::to_string_pretty(&Value::Object(self.outputs))
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
pub trait AuditExecutor: Send + Sync + 'static {
    async fn run_phase(
        &self,
        phase: Phase,
        params: &AuditParams,
        context: &PhaseContext,
    ) -> Result<PhaseOutcome, ExecutorError>;
}

/// Executor implementations shipped with the service. Chosen once from
/// configuration; model-backed variants plug in through [`AuditExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    DryRun,
}

impl ExecutorKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "dry_run" | "dry-run" | "dryrun" => Some(ExecutorKind::DryRun),
            _ => None,
        }
    }

    pub fn build(self, phase_delay: Duration) -> Arc<dyn AuditExecutor> {
        match self {
            ExecutorKind::DryRun => Arc::new(DryRunExecutor::new(phase_delay)),
        }
    }
}
