use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent status of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDefinitionStatus {
    /// Registered, no successful run yet.
    Pending,
    /// Has completed at least one run successfully.
    Active,
    /// Exhausted its retries; not dispatched until re-activated.
    Disabled,
}

impl std::fmt::Display for JobDefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobDefinitionStatus::Pending => "pending",
            JobDefinitionStatus::Active => "active",
            JobDefinitionStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobDefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobDefinitionStatus::Pending),
            "active" => Ok(JobDefinitionStatus::Active),
            "disabled" => Ok(JobDefinitionStatus::Disabled),
            other => Err(format!("unknown job definition status: {other}")),
        }
    }
}

/// Lifecycle state of a single job run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    /// Inserted at enqueue time, waiting in a priority queue.
    Pending,
    /// An attempt is executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished after the last permitted attempt failed.
    Failed,
    /// Between attempts: the previous one failed and a retry is pending.
    Retrying,
}

impl JobRunStatus {
    /// `Success` and `Failed` end a run; no further attempts touch the row.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobRunStatus::Success | JobRunStatus::Failed)
    }

    /// Statuses that count as "outstanding" for the one-run-per-job rule.
    pub const IN_FLIGHT: [JobRunStatus; 3] = [
        JobRunStatus::Pending,
        JobRunStatus::Running,
        JobRunStatus::Retrying,
    ];
}

impl std::fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Running => "running",
            JobRunStatus::Success => "success",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobRunStatus::Pending),
            "running" => Ok(JobRunStatus::Running),
            "success" => Ok(JobRunStatus::Success),
            "failed" => Ok(JobRunStatus::Failed),
            "retrying" => Ok(JobRunStatus::Retrying),
            other => Err(format!("unknown job run status: {other}")),
        }
    }
}

/// One row per distinct job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub status: JobDefinitionStatus,
    /// Whether a successful run schedules another one.
    pub reschedule: bool,
    /// Delay between a successful run and the next; set iff `reschedule`.
    pub reschedule_delay: Option<Duration>,
    /// Finish time of the most recent run. Never touched by upserts.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, reschedule_delay: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            status: JobDefinitionStatus::Pending,
            reschedule: reschedule_delay.is_some(),
            reschedule_delay,
            last_run_at: None,
        }
    }

    /// The delay to apply after a successful run, if this job reschedules.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.reschedule {
            self.reschedule_delay
        } else {
            None
        }
    }
}

/// The single pending future run of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub job_name: String,
    pub next_run_at: DateTime<Utc>,
}

impl ScheduledEntry {
    pub fn new(job_name: impl Into<String>, next_run_at: DateTime<Utc>) -> Self {
        Self {
            job_name: job_name.into(),
            next_run_at,
        }
    }
}

/// A persisted execution record: the audit trail of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Assigned by the store on insert.
    pub id: i64,
    pub job_name: String,
    pub queue_name: String,
    /// Lower value = higher priority.
    pub priority: i32,
    pub status: JobRunStatus,
    /// Number of execution attempts started so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Fields supplied when a run is first inserted (always as `Pending`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRun {
    pub job_name: String,
    pub queue_name: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Partial update of a run row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRunUpdate {
    pub status: Option<JobRunStatus>,
    pub attempts: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Reset `error` to NULL (a retried run that finally succeeds).
    pub clear_error: bool,
}

impl JobRunUpdate {
    pub fn status(status: JobRunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn output(mut self, output: Option<Value>) -> Self {
        self.output = output;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.clear_error = false;
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = None;
        self.clear_error = true;
        self
    }

    /// Apply this update to an in-memory copy of the row.
    pub fn apply_to(&self, run: &mut JobRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(attempts) = self.attempts {
            run.attempts = attempts;
        }
        if let Some(at) = self.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(ref output) = self.output {
            run.output = Some(output.clone());
        }
        if self.clear_error {
            run.error = None;
        } else if let Some(ref error) = self.error {
            run.error = Some(error.clone());
        }
    }
}

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix) so stored
/// timestamps compare correctly as text.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_ts`] (any RFC 3339 value is accepted).
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// `at + delay`, saturating at the latest representable instant.
pub fn add_delay(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
