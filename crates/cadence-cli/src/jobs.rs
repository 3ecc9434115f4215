//! Built-in jobs loaded by the `cadence` binary.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use cadence_scheduler::{BackoffStrategy, Job, JobRegistry, JobResult, Result, RunContext};

/// Register every built-in job.
pub fn registry() -> Result<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register(HelloWorldJob)?;
    registry.register(HeartbeatJob)?;
    Ok(registry)
}

/// One-shot job that logs a short greeting sequence.
pub struct HelloWorldJob;

const HELLO_MESSAGES: u32 = 10;

#[async_trait]
impl Job for HelloWorldJob {
    fn name(&self) -> &str {
        "HelloWorldJob"
    }

    async fn run(&self, ctx: &RunContext) -> JobResult {
        for i in 1..=HELLO_MESSAGES {
            info!(run_id = ctx.run_id, "hello world {i}/{HELLO_MESSAGES}");
        }
        JobResult::success(json!({ "messages": HELLO_MESSAGES }))
    }
}

/// Rescheduling job that records a timestamp every few seconds.
pub struct HeartbeatJob;

#[async_trait]
impl Job for HeartbeatJob {
    fn name(&self) -> &str {
        "HeartbeatJob"
    }

    fn queue(&self) -> &str {
        "low"
    }

    fn max_retries(&self) -> u32 {
        3
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential
    }

    fn reschedule(&self) -> bool {
        true
    }

    fn reschedule_delay(&self) -> Option<Duration> {
        Some(Duration::from_secs(3))
    }

    async fn run(&self, ctx: &RunContext) -> JobResult {
        let at = Utc::now().to_rfc3339();
        info!(run_id = ctx.run_id, attempt = ctx.attempt, %at, "heartbeat");
        JobResult::success(json!({ "at": at }))
    }
}
