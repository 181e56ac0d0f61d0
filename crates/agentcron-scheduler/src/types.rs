use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to do when a job is due while earlier runs of it are still active.
///
/// Values that are not recognised are kept verbatim in [`Other`](Self::Other)
/// so they survive a store round-trip; admission always denies them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConcurrencyPolicy {
    /// Start regardless of active runs.
    Allow,
    /// Refuse the new run while another is active.
    Skip,
    /// Refuse for now; the caller queues the run behind the active one.
    Queue,
    /// Cancel every active run, then start the new one.
    CancelPrevious,
    Other(String),
}

impl ConcurrencyPolicy {
    pub fn as_str(&self) -> &str {
        match self {
            ConcurrencyPolicy::Allow => "allow",
            ConcurrencyPolicy::Skip => "skip",
            ConcurrencyPolicy::Queue => "queue",
            ConcurrencyPolicy::CancelPrevious => "cancel-previous",
            ConcurrencyPolicy::Other(raw) => raw,
        }
    }
}

impl From<String> for ConcurrencyPolicy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "allow" => ConcurrencyPolicy::Allow,
            "skip" => ConcurrencyPolicy::Skip,
            "queue" => ConcurrencyPolicy::Queue,
            "cancel-previous" => ConcurrencyPolicy::CancelPrevious,
            _ => ConcurrencyPolicy::Other(s),
        }
    }
}

impl From<&str> for ConcurrencyPolicy {
    fn from(s: &str) -> Self {
        ConcurrencyPolicy::from(s.to_string())
    }
}

impl From<ConcurrencyPolicy> for String {
    fn from(p: ConcurrencyPolicy) -> Self {
        p.as_str().to_string()
    }
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a recurring unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    /// Disabled jobs are never scheduled.
    pub enabled: bool,
    /// Cron expression (five fields, or six/seven with seconds/years).
    pub schedule: String,
    /// IANA zone name; the scheduler default applies when absent.
    pub timezone: Option<String>,
    /// Upper bound of the random delay added to each occurrence.
    pub jitter_ms: u64,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Materialize every missed occurrence since the last success.
    pub catchup: bool,
    pub concurrency: ConcurrencyPolicy,
    /// Opaque JSON payload forwarded to the executor.
    pub action: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Last edit of the definition. Re-opens an exhausted schedule window.
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// An enabled job with no window, no jitter, no catch-up and `allow` policy.
    pub fn new(id: impl Into<String>, schedule: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            schedule: schedule.into(),
            timezone: None,
            jitter_ms: 0,
            not_before: None,
            not_after: None,
            catchup: false,
            concurrency: ConcurrencyPolicy::Allow,
            action: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_window(
        mut self,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn with_concurrency(mut self, policy: impl Into<ConcurrencyPolicy>) -> Self {
        self.concurrency = policy.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_action(mut self, action: serde_json::Value) -> Self {
        self.action = action;
        self
    }

    /// Whether `other` describes the same schedule and payload.
    ///
    /// Ignores `enabled` and the timestamps, which are runtime state.
    pub fn same_definition(&self, other: &JobDefinition) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.schedule == other.schedule
            && self.timezone == other.timezone
            && self.jitter_ms == other.jitter_ms
            && self.not_before == other.not_before
            && self.not_after == other.not_after
            && self.catchup == other.catchup
            && self.concurrency == other.concurrency
            && self.action == other.action
    }
}

impl From<agentcron_core::config::JobConfig> for JobDefinition {
    fn from(cfg: agentcron_core::config::JobConfig) -> Self {
        let mut job = JobDefinition::new(cfg.id, cfg.schedule)
            .with_jitter_ms(cfg.jitter_ms)
            .with_window(cfg.not_before, cfg.not_after)
            .with_catchup(cfg.catchup)
            .with_concurrency(cfg.concurrency)
            .with_enabled(cfg.enabled)
            .with_action(cfg.action);
        if let Some(name) = cfg.name {
            job.name = name;
        }
        job.timezone = cfg.timezone;
        job
    }
}

/// Per-job scheduling bookkeeping. Exactly one per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub job_id: String,
    /// `None` once the validity window is exhausted.
    pub next_due: Option<DateTime<Utc>>,
    pub last_scheduled: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// When the engine last reconciled this row.
    pub updated_at: DateTime<Utc>,
}

impl ScheduleState {
    pub fn new(job_id: impl Into<String>, next_due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            next_due,
            last_scheduled: None,
            last_attempt: None,
            last_success: None,
            updated_at: now,
        }
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Materialized by the engine, not yet handed out.
    Due,
    /// Handed to the dispatch queue.
    Scheduled,
    /// Admitted; the executor is spinning up.
    Starting,
    /// The executor is doing the work.
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }

    /// Active runs count against the job's concurrency policy.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }

    /// Not yet handed to an executor.
    pub fn is_pending(self) -> bool {
        matches!(self, RunState::Due | RunState::Scheduled)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Due, Scheduled)
                | (Scheduled, Starting)
                | (Starting, Running)
                | (Starting | Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Due => "due",
            RunState::Scheduled => "scheduled",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "due" => Ok(RunState::Due),
            "scheduled" => Ok(RunState::Scheduled),
            "starting" => Ok(RunState::Starting),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "cancelled" => Ok(RunState::Cancelled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// Usage accounting reported by the executor. Persisted, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub steps: u64,
    pub tokens: u64,
    pub duration_ms: u64,
    pub bandwidth_bytes: u64,
}

/// One scheduled or attempted occurrence of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUIDv7 string, time-sortable.
    pub id: String,
    pub job_id: String,
    /// The occurrence this run stands for.
    pub scheduled_at: DateTime<Utc>,
    /// Requested by an operator; not an occurrence of the schedule.
    #[serde(default)]
    pub manual: bool,
    /// Retry counter, owned by the executor.
    pub attempt: u32,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `state` is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub resource_usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// A fresh `Due` run for the occurrence at `scheduled_at`.
    pub fn due(job_id: impl Into<String>, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            scheduled_at,
            manual: false,
            attempt: 0,
            state: RunState::Due,
            started_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            resource_usage: ResourceUsage::default(),
            created_at: now,
        }
    }

    /// A `Due` run requested by an operator at `now`, outside the schedule.
    pub fn manual(job_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            manual: true,
            ..Self::due(job_id, now, now)
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub can_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The active run that blocked admission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_run_id: Option<String>,
}

impl Admission {
    pub fn admit() -> Self {
        Self {
            can_run: true,
            reason: None,
            existing_run_id: None,
        }
    }

    pub fn deny(reason: impl Into<String>, existing_run_id: Option<String>) -> Self {
        Self {
            can_run: false,
            reason: Some(reason.into()),
            existing_run_id,
        }
    }
}

/// What a lifecycle call did to the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "run", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The transition happened; carries the updated run.
    Applied(RunRecord),
    /// Already in the target state, or the edge is not allowed from the
    /// current state. Carries the run as stored.
    Unchanged(RunRecord),
    /// No run with that id exists.
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn run(&self) -> Option<&RunRecord> {
        match self {
            TransitionOutcome::Applied(run) | TransitionOutcome::Unchanged(run) => Some(run),
            TransitionOutcome::NotFound => None,
        }
    }
}

/// Result of reconciling one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub job_id: String,
    pub next_due: Option<DateTime<Utc>>,
    pub runs_created: usize,
}

/// Aggregate result of reconciling every enabled job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scheduled: Vec<ScheduleOutcome>,
    /// `(job_id, error message)` for every job whose reconciliation failed.
    pub failures: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
