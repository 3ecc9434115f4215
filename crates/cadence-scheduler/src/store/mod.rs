//! Persistence contract the dispatch engine depends on.
//!
//! Every method is atomic for the row(s) it touches and durable before it
//! returns. No cross-row transactions are assumed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    JobDefinition, JobDefinitionStatus, JobRun, JobRunUpdate, NewJobRun, ScheduledEntry,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a run with status `pending` and return its id.
    async fn insert_job_run(&self, run: NewJobRun) -> StoreResult<i64>;

    /// Apply a partial update. `RunNotFound` if no row has `id`.
    async fn update_job_run(&self, id: i64, update: JobRunUpdate) -> StoreResult<()>;

    async fn get_job_run(&self, id: i64) -> StoreResult<Option<JobRun>>;

    /// Newest runs first, optionally restricted to one job.
    async fn list_job_runs(&self, job_name: Option<&str>, limit: usize) -> StoreResult<Vec<JobRun>>;

    /// Whether any run for `job_name` is `pending`, `running` or `retrying`.
    async fn has_outstanding_run(&self, job_name: &str) -> StoreResult<bool>;

    /// Mark every in-flight run `failed` with `reason`. Returns the row count.
    async fn recover_interrupted_runs(&self, reason: &str, at: DateTime<Utc>) -> StoreResult<usize>;

    /// Insert or update by name: status, reschedule and delay are written,
    /// `last_run_at` is left as is.
    async fn upsert_job_definition(&self, def: &JobDefinition) -> StoreResult<()>;

    async fn get_job_definition(&self, name: &str) -> StoreResult<Option<JobDefinition>>;

    async fn list_job_definitions(&self) -> StoreResult<Vec<JobDefinition>>;

    /// Set a definition's status, and its `last_run_at` when given.
    /// Silently ignores unknown names.
    async fn set_job_status(
        &self,
        name: &str,
        status: JobDefinitionStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Replace the entry for `entry.job_name`, creating it if missing.
    async fn upsert_scheduled_entry(&self, entry: &ScheduledEntry) -> StoreResult<()>;

    /// Remove the entry for `job_name`; no-op when absent.
    async fn remove_scheduled_entry(&self, job_name: &str) -> StoreResult<()>;

    /// Entries with `next_run_at <= now`, in no particular order.
    async fn due_scheduled_entries(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledEntry>>;

    /// All entries ordered by `next_run_at`.
    async fn list_scheduled_entries(&self) -> StoreResult<Vec<ScheduledEntry>>;
}
