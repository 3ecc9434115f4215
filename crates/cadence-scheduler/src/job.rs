use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::BackoffStrategy;

pub use cadence_core::config::DEFAULT_QUEUE;

/// Outcome reported by [`Job::run`].
///
/// Expected failures should be returned as `Failed` rather than by
/// panicking; a panic is still caught and recorded, but indicates a defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Success { output: Option<Value> },
    Failed { error: String },
}

impl JobResult {
    pub fn success(output: Value) -> Self {
        JobResult::Success {
            output: Some(output),
        }
    }

    pub fn empty() -> Self {
        JobResult::Success { output: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobResult::Failed {
            error: error.into(),
        }
    }
}

/// Per-attempt information handed to a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Id of the persisted run row this attempt belongs to.
    pub run_id: i64,
    pub job_name: String,
    /// 1-based attempt number within the run.
    pub attempt: u32,
}

/// The contract every schedulable unit of work satisfies.
///
/// Implementors only need [`Job::name`] and [`Job::run`]; everything else has
/// a default. Metadata methods must return the same value on every call:
/// they are read at registration and again at dispatch.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique, non-empty name across the registry.
    fn name(&self) -> &str;

    /// Queue the job is dispatched through.
    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    /// Overrides the priority of the job's queue for runs of this job.
    fn priority(&self) -> Option<i32> {
        None
    }

    /// Retry budget. `0` and `1` both mean a single attempt.
    fn max_retries(&self) -> u32 {
        0
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::None
    }

    /// Overrides the engine-wide backoff base delay for this job.
    fn backoff_base_delay(&self) -> Option<Duration> {
        None
    }

    /// Whether a successful run schedules another one. Requires
    /// [`Job::reschedule_delay`].
    fn reschedule(&self) -> bool {
        false
    }

    fn reschedule_delay(&self) -> Option<Duration> {
        None
    }

    /// Execute one attempt.
    async fn run(&self, ctx: &RunContext) -> JobResult;
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name())
            .field("queue", &self.queue())
            .finish()
    }
}
