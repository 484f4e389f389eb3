use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};

pub const DEFAULT_TIMEOUT_SEC: u64 = 900;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
// ten years
const MAX_DEADLINE_SECS: i64 = 10 * 365 * 24 * 3600;

// ----------------------------
// Status + state machine
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
        JobStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "canceled" | "cancelled" => Some(JobStatus::Canceled),
            "expired" => Some(JobStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Allowed edges:
    /// queued -> running | canceled
    /// running -> succeeded | failed | canceled | expired
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(next, JobStatus::Running | JobStatus::Canceled),
            JobStatus::Running => matches!(
                next,
                JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Expired
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------
// Phases + progress
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preflight,
    Fetch,
    Analysis,
    Llm,
    Reporting,
    Final,
}

impl Phase {
    /// Fixed execution order of every job.
    pub const SEQUENCE: [Phase; 6] = [
        Phase::Preflight,
        Phase::Fetch,
        Phase::Analysis,
        Phase::Llm,
        Phase::Reporting,
        Phase::Final,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Fetch => "fetch",
            Phase::Analysis => "analysis",
            Phase::Llm => "llm",
            Phase::Reporting => "reporting",
            Phase::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Phase::SEQUENCE.into_iter().find(|p| p.as_str() == s.trim())
    }

    /// Percent recorded once this phase has completed.
    pub fn completion_percent(&self) -> u8 {
        match self {
            Phase::Preflight => 10,
            Phase::Fetch => 25,
            Phase::Analysis => 50,
            Phase::Llm => 75,
            Phase::Reporting => 90,
            Phase::Final => 100,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub percent: u8,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: Phase::Preflight,
            percent: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed_sec: f64,
}

impl Metrics {
    /// Accumulate a delta. Counters only ever grow.
    pub fn merge(&mut self, delta: &Metrics) {
        self.calls = self.calls.saturating_add(delta.calls);
        self.prompt_tokens = self.prompt_tokens.saturating_add(delta.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(delta.completion_tokens);
        if delta.elapsed_sec.is_finite() && delta.elapsed_sec > 0.0 {
            self.elapsed_sec += delta.elapsed_sec;
        }
    }
}

/// Pointer to a persisted report artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRef {
    pub path: String,
    pub sha256: String,
}

// ----------------------------
// Submission
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Github,
    Url,
    Inline,
}

impl SourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "github" => Some(SourceKind::Github),
            "url" => Some(SourceKind::Url),
            "inline" => Some(SourceKind::Inline),
            _ => None,
        }
    }
}

/// Validated source description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub url: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub inline_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout_sec() -> u64 {
    DEFAULT_TIMEOUT_SEC
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub project: Option<String>,
    pub contact: Option<String>,
}

/// Parameters an audit runs with, stored verbatim on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditParams {
    pub source: Source,
    pub llm_config: LlmConfig,
    pub audit_profile: String,
    pub timeout_sec: u64,
    pub client_meta: Option<ClientMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub inline_code: Option<String>,
}

/// Raw submission as received at the boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub source: SourceSpec,
    #[serde(default, alias = "llm")]
    pub llm_config: LlmConfig,
    pub audit_profile: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    pub idempotency_key: Option<String>,
    pub client_meta: Option<ClientMeta>,
}

impl SubmitRequest {
    /// Turn the raw request into job parameters plus its idempotency key.
    pub fn validate(self) -> AuditResult<(AuditParams, Option<String>)> {
        let kind = SourceKind::parse(&self.source.kind).ok_or_else(|| {
            AuditError::Validation(format!(
                "unsupported source type: {:?} (expected github, url or inline)",
                self.source.kind
            ))
        })?;

        let url = non_blank(self.source.url);
        let inline_code = non_blank(self.source.inline_code);
        match kind {
            SourceKind::Github | SourceKind::Url if url.is_none() => {
                return Err(AuditError::Validation(
                    "source.url is required for github and url sources".into(),
                ));
            }
            SourceKind::Inline if inline_code.is_none() => {
                return Err(AuditError::Validation(
                    "source.inline_code is required for inline sources".into(),
                ));
            }
            _ => {}
        }

        let audit_profile = self.audit_profile.trim().to_string();
        if audit_profile.is_empty() {
            return Err(AuditError::Validation("audit_profile is required".into()));
        }
        if self.timeout_sec == 0 {
            return Err(AuditError::Validation("timeout_sec must be > 0".into()));
        }
        if self.llm_config.model.trim().is_empty() {
            return Err(AuditError::Validation("llm_config.model is required".into()));
        }
        if self.llm_config.max_tokens == 0 {
            return Err(AuditError::Validation(
                "llm_config.max_tokens must be > 0".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm_config.temperature) {
            return Err(AuditError::Validation(
                "llm_config.temperature must be within 0.0..=2.0".into(),
            ));
        }

        let idempotency_key = match self.idempotency_key {
            Some(key) => {
                let key = key.trim().to_string();
                if key.is_empty() {
                    return Err(AuditError::Validation(
                        "idempotency_key must not be blank".into(),
                    ));
                }
                if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                    return Err(AuditError::Validation(format!(
                        "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
                    )));
                }
                Some(key)
            }
            None => None,
        };

        let params = AuditParams {
            source: Source {
                kind,
                url,
                git_ref: non_blank(self.source.git_ref),
                inline_code,
            },
            llm_config: self.llm_config,
            audit_profile,
            timeout_sec: self.timeout_sec,
            client_meta: self.client_meta,
        };

        Ok((params, idempotency_key))
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

// ----------------------------
// Job record
// ----------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    pub idempotency_key: Option<String>,
    pub params: AuditParams,
    pub status: JobStatus,
    pub progress: Progress,
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    /// Effective timeout (already capped by the configured hard timeout).
    pub timeout_sec: u64,
    /// Set when the job enters `running`.
    pub timeout_deadline: Option<DateTime<Utc>>,
    pub report_ref: Option<ReportRef>,
}

impl Job {
    pub fn new_queued(
        params: AuditParams,
        idempotency_key: Option<String>,
        timeout_sec: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            idempotency_key,
            params,
            status: JobStatus::Queued,
            progress: Progress::default(),
            metrics: Metrics::default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            error_message: None,
            cancel_requested: false,
            timeout_sec,
            timeout_deadline: None,
            report_ref: None,
        }
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.timeout_deadline.is_some_and(|d| d <= now)
    }

    pub fn links(&self) -> JobLinks {
        JobLinks::for_job(self.job_id, self.status)
    }

    /// Apply a patch in place. Progress never moves backwards and metrics
    /// are accumulated, so a patch can be applied by any mutation path.
    pub fn apply_patch(&mut self, patch: JobPatch) {
        if let Some(at) = patch.started_at {
            self.started_at.get_or_insert(at);
        }
        if let Some(at) = patch.finished_at {
            self.finished_at = Some(at);
        }
        if let Some(deadline) = patch.timeout_deadline {
            self.timeout_deadline = Some(deadline);
        }
        if let Some(msg) = patch.error_message {
            self.error_message = Some(msg);
        }
        if let Some(progress) = patch.progress {
            if progress.percent >= self.progress.percent {
                self.progress = progress;
            }
        }
        if let Some(delta) = patch.metrics {
            self.metrics.merge(&delta);
        }
        if let Some(report_ref) = patch.report_ref {
            self.report_ref = Some(report_ref);
        }
    }
}

/// Field changes carried along with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeout_deadline: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress: Option<Progress>,
    /// Delta merged into the accumulated metrics.
    pub metrics: Option<Metrics>,
    pub report_ref: Option<ReportRef>,
}

impl JobPatch {
    pub fn started(now: DateTime<Utc>, timeout_sec: u64) -> Self {
        let secs = i64::try_from(timeout_sec)
            .unwrap_or(MAX_DEADLINE_SECS)
            .min(MAX_DEADLINE_SECS);
        Self {
            started_at: Some(now),
            timeout_deadline: Some(now + chrono::Duration::seconds(secs)),
            ..Self::default()
        }
    }

    pub fn finished(now: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_report(mut self, report_ref: ReportRef) -> Self {
        self.report_ref = Some(report_ref);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub report: Option<String>,
}

impl JobLinks {
    pub fn for_job(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            self_link: format!("/jobs/{job_id}"),
            report: (status == JobStatus::Succeeded).then(|| format!("/jobs/{job_id}/report")),
        }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub expired: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Canceled => &mut self.canceled,
            JobStatus::Expired => &mut self.expired,
        };
        *slot += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(v: serde_json::Value) -> SubmitRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn only_allowed_edges_are_accepted() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Canceled));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Queued.can_transition_to(Expired));
        for next in [Succeeded, Failed, Canceled, Expired] {
            assert!(Running.can_transition_to(next));
        }
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Succeeded, Failed, Canceled, Expired] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_and_phase_names_round_trip() {
        for s in JobStatus::ALL {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        for p in Phase::SEQUENCE {
            assert_eq!(Phase::parse(p.as_str()), Some(p));
        }
        assert_eq!(JobStatus::parse("dlq"), None);
    }

    #[test]
    fn phase_percents_are_increasing_and_end_at_100() {
        let percents: Vec<u8> = Phase::SEQUENCE
            .iter()
            .map(|p| p.completion_percent())
            .collect();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn patch_never_lowers_progress() {
        let params = request(json!({
            "source": {"type": "inline", "inline_code": "contract A {}"},
            "audit_profile": "general_v1"
        }))
        .validate()
        .unwrap()
        .0;
        let mut job = Job::new_queued(params, None, 60, Utc::now());
        job.apply_patch(JobPatch::default().with_progress(Progress {
            phase: Phase::Analysis,
            percent: 50,
        }));
        job.apply_patch(JobPatch::default().with_progress(Progress {
            phase: Phase::Fetch,
            percent: 25,
        }));
        assert_eq!(job.progress.percent, 50);
        assert_eq!(job.progress.phase, Phase::Analysis);
    }

    #[test]
    fn metrics_accumulate() {
        let mut m = Metrics::default();
        m.merge(&Metrics {
            calls: 1,
            prompt_tokens: 10,
            completion_tokens: 5,
            elapsed_sec: 1.5,
        });
        m.merge(&Metrics {
            calls: 2,
            prompt_tokens: 1,
            completion_tokens: 1,
            elapsed_sec: -3.0,
        });
        assert_eq!(m.calls, 3);
        assert_eq!(m.prompt_tokens, 11);
        assert_eq!(m.completion_tokens, 6);
        assert_eq!(m.elapsed_sec, 1.5);
    }

    #[test]
    fn validate_applies_defaults() {
        let (params, key) = request(json!({
            "source": {"type": "github", "url": "https://github.com/acme/token", "ref": "main"},
            "audit_profile": " erc20_basic ",
            "idempotency_key": " k1 "
        }))
        .validate()
        .unwrap();
        assert_eq!(params.timeout_sec, DEFAULT_TIMEOUT_SEC);
        assert_eq!(params.audit_profile, "erc20_basic");
        assert_eq!(params.llm_config, LlmConfig::default());
        assert_eq!(params.source.kind, SourceKind::Github);
        assert_eq!(params.source.git_ref.as_deref(), Some("main"));
        assert_eq!(key.as_deref(), Some("k1"));
    }

    #[test]
    fn validate_rejects_malformed_submissions() {
        let cases = [
            json!({"source": {"type": "ftp", "url": "x"}, "audit_profile": "p"}),
            json!({"source": {"type": "url"}, "audit_profile": "p"}),
            json!({"source": {"type": "inline", "inline_code": "  "}, "audit_profile": "p"}),
            json!({"source": {"type": "inline", "inline_code": "c"}, "audit_profile": ""}),
            json!({"source": {"type": "inline", "inline_code": "c"}, "audit_profile": "p", "timeout_sec": 0}),
            json!({"source": {"type": "inline", "inline_code": "c"}, "audit_profile": "p", "idempotency_key": ""}),
            json!({"source": {"type": "inline", "inline_code": "c"}, "audit_profile": "p", "llm": {"temperature": 9.0}}),
        ];
        for case in cases {
            let err = request(case.clone()).validate().unwrap_err();
            assert!(
                matches!(err, AuditError::Validation(_)),
                "expected validation error for {case}, got {err:?}"
            );
        }
    }

    #[test]
    fn report_link_only_when_succeeded() {
        let id = Uuid::new_v4();
        assert!(JobLinks::for_job(id, JobStatus::Running).report.is_none());
        assert_eq!(
            JobLinks::for_job(id, JobStatus::Succeeded).report,
            Some(format!("/jobs/{id}/report"))
        );
    }
}
