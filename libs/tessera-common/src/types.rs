use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

/// Outcome of a method, a class, or a whole run.
///
/// Ranked `error > failed > skipped > passed`; a parent always takes the
/// worst status among its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Skipped,
    Failed,
    Error,
}

impl Status {
    fn severity(self) -> u8 {
        match self {
            Status::Passed => 0,
            Status::Skipped => 1,
            Status::Failed => 2,
            Status::Error => 3,
        }
    }

    /// Worst of two statuses.
    pub fn max(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Worst status among `statuses`, `Passed` when empty.
    pub fn worst<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses.into_iter().fold(Status::Passed, Status::max)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Passed => "passed",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
            Status::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of a queued test run.
///
/// `Queued -> Running | Cancelled`, `Running -> Completed | Errored | Cancelled`.
/// Terminal states never move again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    #[serde(rename = "error")]
    Errored,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Errored | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Queued => matches!(next, JobState::Running | JobState::Cancelled),
            JobState::Running => matches!(
                next,
                JobState::Completed | JobState::Errored | JobState::Cancelled
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Errored => "error",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One queued test-run request, as seen from outside the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Normalized spec
    pub spec: String,
    pub qualifiers: String,
    pub root_path: String,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassManifest {
    pub class_name: String,
    pub methods: Vec<String>,
}

/// The ordered set of classes and methods a run will execute.
///
/// Built once per run and never mutated afterwards; classes with no
/// qualifying methods are left out by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub package_prefix: String,
    pub classes: Vec<ClassManifest>,
}

impl Manifest {
    pub fn new(package_prefix: impl Into<String>, classes: Vec<ClassManifest>) -> Self {
        Self {
            package_prefix: package_prefix.into(),
            classes: classes
                .into_iter()
                .filter(|c| !c.methods.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn method_count(&self) -> usize {
        self.classes.iter().map(|c| c.methods.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Execution result document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub action: String,
    pub description: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResult {
    pub name: String,
    pub status: Status,
    pub duration_ms: u64,
    pub assertions: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassResult {
    pub name: String,
    pub status: Status,
    pub duration_ms: u64,
    pub methods: Vec<MethodResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Assertion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub duration_ms: u64,
}

impl Summary {
    pub fn count(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Error => self.errors += 1,
            Status::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: Status,
    #[serde(default)]
    pub cancelled: bool,
    pub summary: Summary,
    pub classes: Vec<ClassResult>,
}

impl ExecutionResult {
    /// Result of a run that never started (cancelled while queued).
    pub fn cancelled_before_start() -> Self {
        Self {
            status: Status::Passed,
            cancelled: true,
            summary: Summary::default(),
            classes: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Caller-facing documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub status: JobState,
    #[serde(rename = "jobID")]
    pub job_id: JobId,
}

/// Snapshot returned by `poll`. Result fields are only present once the
/// job is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(rename = "jobID")]
    pub job_id: JobId,
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<ClassResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    #[serde(rename = "jobID")]
    pub job_id: JobId,
    pub status: JobState,
    pub spec: String,
    pub enqueued_at: DateTime<Utc>,
}
