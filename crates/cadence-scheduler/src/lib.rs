//! `cadence-scheduler`: persistent, priority-aware job scheduler.
//!
//! # Overview
//!
//! Jobs implement [`Job`] and are loaded into a [`JobRegistry`]. The
//! [`SchedulerEngine`] polls a [`JobStore`] for due scheduled entries every
//! tick, records a `pending` run for each, and feeds it into the priority
//! queue of the job's named queue. Each queue executes at most one run at a
//! time; queues are visited in (priority, name) order.
//!
//! # Run lifecycle
//!
//! | Status     | Meaning                                              |
//! |------------|------------------------------------------------------|
//! | `pending`  | Enqueued, waiting for its queue to become idle       |
//! | `running`  | An attempt is executing                              |
//! | `retrying` | An attempt failed; waiting out the backoff delay     |
//! | `success`  | Terminal: an attempt succeeded                       |
//! | `failed`   | Terminal: retries exhausted, or interrupted by a restart |
//!
//! A job name never has more than one non-terminal run. Successful runs of
//! rescheduling jobs are followed by a new entry at `finished_at + delay`;
//! exhausting retries disables the job until it is re-enabled.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;
pub mod types;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use engine::{QueueStats, SchedulerEngine};
pub use error::{JobError, Result, SchedulerError, StoreError};
pub use job::{Job, JobResult, RunContext, DEFAULT_QUEUE};
pub use registry::JobRegistry;
pub use store::{JobStore, MemoryStore, SqliteStore};
pub use types::{
    JobDefinition, JobDefinitionStatus, JobRun, JobRunStatus, ScheduledEntry,
};
