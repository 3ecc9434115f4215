use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use cadence_core::config::{SchedulerConfig, DEFAULT_QUEUE};

use crate::{
    backoff::RetryPolicy,
    error::{JobError, Result, SchedulerError, StoreError},
    job::{Job, JobResult, RunContext},
    queue::{PriorityQueue, QueueItem},
    registry::{definition_for, JobRegistry},
    store::{JobStore, StoreResult},
    types::{
        add_delay, JobDefinitionStatus, JobRunStatus, JobRunUpdate, NewJobRun, ScheduledEntry,
    },
};

/// Error recorded on runs that were in flight when a previous process died.
pub const RESTART_REASON: &str = "process restarted";

/// Non-terminal writes are retried this many times before the engine gives
/// up on them. Terminal run writes are retried until they land.
const STORE_WRITE_ATTEMPTS: u32 = 3;

/// Observability snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub priority: i32,
    /// Items waiting to be dispatched.
    pub queued: usize,
    /// Whether a run from this queue is executing right now.
    pub busy: bool,
}

/// Core scheduler: polls the store for due jobs, feeds per-queue priority
/// queues and executes at most one job per queue at a time.
///
/// Drive it with [`start`](Self::start) / [`stop`](Self::stop), or step it
/// manually with [`bootstrap`](Self::bootstrap), [`tick`](Self::tick) and
/// [`settle`](Self::settle).
pub struct SchedulerEngine {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Option<Lifecycle>>,
}

struct Lifecycle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    /// Sorted by (priority, name): the order queues are visited each tick.
    lanes: Vec<Lane>,
    default_lane: usize,
    /// Serialises ticks so a manual tick cannot race the timer loop.
    tick_lock: tokio::sync::Mutex<()>,
    /// Runs created by this engine whose terminal write has not landed yet.
    owned: Mutex<HashMap<String, OwnedRun>>,
    stopping: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct OwnedRun {
    run_id: i64,
    /// The job finished but persisting its outcome keeps failing.
    stalled: bool,
}

/// One named queue plus the slot tracking its in-flight execution.
struct Lane {
    name: String,
    priority: i32,
    queue: Mutex<PriorityQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Lane {
    fn is_busy(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// A store mutation that is retried when it fails.
enum StoreWrite<'a> {
    Run(&'a str, i64, JobRunUpdate),
    Status(&'a str, JobDefinitionStatus, Option<DateTime<Utc>>),
    Schedule(ScheduledEntry),
    Unschedule(&'a str),
}

impl SchedulerEngine {
    /// Build an engine over `store` for the jobs in `registry`.
    ///
    /// One queue is created per configured queue name, plus `default`, plus
    /// any queue a registered job names without it being configured (those
    /// get `default_priority`).
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let mut priorities: BTreeMap<String, i32> = config
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.priority))
            .collect();
        priorities
            .entry(DEFAULT_QUEUE.to_string())
            .or_insert_with(|| config.priority_for(DEFAULT_QUEUE));
        for job in registry.iter() {
            if !priorities.contains_key(job.queue()) {
                let priority = config.priority_for(job.queue());
                warn!(
                    job = job.name(),
                    queue = job.queue(),
                    priority,
                    "job uses an unconfigured queue; using default priority"
                );
                priorities.insert(job.queue().to_string(), priority);
            }
        }

        let mut lanes: Vec<Lane> = priorities
            .into_iter()
            .map(|(name, priority)| Lane {
                name,
                priority,
                queue: Mutex::new(PriorityQueue::new()),
                worker: Mutex::new(None),
            })
            .collect();
        lanes.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        let default_lane = lanes
            .iter()
            .position(|lane| lane.name == DEFAULT_QUEUE)
            .unwrap_or_default();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                registry: Arc::new(registry),
                lanes,
                default_lane,
                tick_lock: tokio::sync::Mutex::new(()),
                owned: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.shared.registry
    }

    /// Queues in dispatch order with their current depth.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.shared
            .lanes
            .iter()
            .map(|lane| QueueStats {
                name: lane.name.clone(),
                priority: lane.priority,
                queued: lock(&lane.queue).len(),
                busy: lane.is_busy(),
            })
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Start the timer loop. Idempotent.
    ///
    /// Reconciles runs left in flight by a previous process, syncs every
    /// registered job into the store, then polls immediately and every
    /// `tick_interval` afterwards.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("scheduler engine already running");
            return Ok(());
        }

        self.shared.bootstrap().await?;
        self.shared.stopping.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&self.shared).run(shutdown_rx));
        *lifecycle = Some(Lifecycle { shutdown_tx, task });
        Ok(())
    }

    /// Stop the timer loop and let in-flight runs settle. Idempotent.
    ///
    /// Items still waiting in the queues are dropped; their `pending` rows
    /// are reconciled by the next `start`. Runs that outlive
    /// `shutdown_grace` are abandoned and stay `running` until then, as do
    /// runs whose outcome still cannot be written.
    ///
    /// The engine stays restartable, so it keeps its store handle; the
    /// handle is released when the engine is dropped.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.lifecycle.lock().await.take() else {
            debug!("scheduler engine not running");
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = lifecycle.shutdown_tx.send(true);
        if let Err(e) = lifecycle.task.await {
            error!("scheduler loop ended abnormally: {e}");
        }

        let dropped = self.shared.drain_queues();
        if dropped > 0 {
            info!(count = dropped, "queued runs dropped; they will be reconciled on next start");
        }
        self.shared.settle(self.shared.config.shutdown_grace()).await;
        info!("scheduler engine stopped");
    }

    /// Recover interrupted runs and sync registered jobs into the store.
    /// `start` does this itself; call it directly only when driving ticks by hand.
    pub async fn bootstrap(&self) -> Result<()> {
        self.shared.bootstrap().await
    }

    /// One poll phase followed by one run-phase step per queue.
    pub async fn tick(&self) {
        self.shared.tick().await;
    }

    /// Wait (up to `shutdown_grace`) for every in-flight execution to finish.
    pub async fn settle(&self) {
        self.shared.settle(self.shared.config.shutdown_grace()).await;
    }

    /// Re-activate a job that was disabled after exhausting its retries and
    /// schedule it to run immediately.
    pub async fn enable_job(&self, name: &str) -> Result<()> {
        let job = self
            .shared
            .registry
            .get(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;

        let def = definition_for(job.as_ref());
        self.shared
            .store_call(self.shared.store.upsert_job_definition(&def))
            .await?;
        self.shared
            .store_call(
                self.shared
                    .store
                    .upsert_scheduled_entry(&ScheduledEntry::new(name, Utc::now())),
            )
            .await?;
        info!(job = name, "job re-enabled");
        Ok(())
    }
}

impl Shared {
    /// Main event loop. Ticks every `tick_interval` until `shutdown` broadcasts `true`.
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.tick_interval_ms,
            queues = self.lanes.len(),
            jobs = self.registry.len(),
            "scheduler engine started"
        );

        // The first tick completes immediately, giving the initial poll.
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let now = Utc::now();
        let recovered = self
            .store_call(self.store.recover_interrupted_runs(RESTART_REASON, now))
            .await?;
        if recovered > 0 {
            warn!(count = recovered, "runs interrupted by a previous process marked failed");
        }
        // Recovery closed every in-flight row, ours included.
        lock(&self.owned).clear();

        for job in self.registry.iter() {
            self.sync_job(job.as_ref(), now).await?;
        }
        Ok(())
    }

    /// Upsert the job's definition and seed its first scheduled entry.
    async fn sync_job(&self, job: &dyn Job, now: DateTime<Utc>) -> Result<()> {
        let name = job.name();
        let existing = self.store_call(self.store.get_job_definition(name)).await?;

        let mut def = definition_for(job);
        def.status = match existing.map(|d| d.status) {
            Some(JobDefinitionStatus::Disabled) if self.config.reactivate_disabled => {
                info!(job = name, "re-activating disabled job");
                JobDefinitionStatus::Pending
            }
            Some(status) => status,
            None => JobDefinitionStatus::Pending,
        };
        self.store_call(self.store.upsert_job_definition(&def)).await?;

        if def.status == JobDefinitionStatus::Disabled {
            info!(job = name, "job is disabled; not scheduling");
            return Ok(());
        }

        let next_run_at = def.next_delay().map_or(now, |delay| add_delay(now, delay));
        self.store_call(
            self.store
                .upsert_scheduled_entry(&ScheduledEntry::new(name, next_run_at)),
        )
        .await?;
        info!(job = name, %next_run_at, "job scheduled");
        Ok(())
    }

    async fn tick(self: &Arc<Self>) {
        let _guard = self.tick_lock.lock().await;
        self.poll().await;
        self.dispatch().await;
    }

    // --- poll phase ----------------------------------------------------------

    async fn poll(&self) {
        let now = Utc::now();
        let due = match self.store_call(self.store.due_scheduled_entries(now)).await {
            Ok(due) => due,
            Err(e) => {
                error!("poll for due jobs failed: {e}");
                return;
            }
        };

        for entry in due {
            if let Err(e) = self.enqueue_due(&entry, now).await {
                error!(job = %entry.job_name, "could not enqueue due job: {e}");
            }
        }
    }

    async fn enqueue_due(&self, entry: &ScheduledEntry, now: DateTime<Utc>) -> StoreResult<()> {
        let name = entry.job_name.as_str();

        let Some(job) = self.registry.get(name) else {
            warn!(job = name, "scheduled job has no loaded implementation; removing entry");
            return self.store_call(self.store.remove_scheduled_entry(name)).await;
        };

        if let Some(def) = self.store_call(self.store.get_job_definition(name)).await? {
            if def.status == JobDefinitionStatus::Disabled {
                info!(job = name, "job is disabled; removing entry");
                return self.store_call(self.store.remove_scheduled_entry(name)).await;
            }
        }

        // At most one pending/running run per job name.
        if self.store_call(self.store.has_outstanding_run(name)).await? {
            let owned = lock(&self.owned).get(name).copied();
            match owned {
                Some(run) if run.stalled => warn!(
                    job = name,
                    run_id = run.run_id,
                    "previous run finished but its outcome is not persisted yet; not enqueuing"
                ),
                Some(run) => debug!(
                    job = name,
                    run_id = run.run_id,
                    "previous run still in progress; not enqueuing"
                ),
                None => warn!(
                    job = name,
                    "outstanding run not owned by this scheduler; not enqueuing"
                ),
            }
            return Ok(());
        }

        let lane = self.lane(job.queue());
        let priority = job.priority().unwrap_or(lane.priority);
        let run_id = self
            .store_call(self.store.insert_job_run(NewJobRun {
                job_name: name.to_string(),
                queue_name: lane.name.clone(),
                priority,
                enqueued_at: now,
            }))
            .await?;

        lock(&self.owned).insert(
            name.to_string(),
            OwnedRun {
                run_id,
                stalled: false,
            },
        );
        lock(&lane.queue).enqueue(QueueItem {
            job: Arc::clone(job),
            run_id,
            priority,
            enqueued_at: now,
        });
        info!(job = name, run_id, queue = %lane.name, priority, "job enqueued");
        Ok(())
    }

    fn lane(&self, queue: &str) -> &Lane {
        self.lanes
            .iter()
            .find(|lane| lane.name == queue)
            .unwrap_or(&self.lanes[self.default_lane])
    }

    // --- run phase -----------------------------------------------------------

    async fn dispatch(self: &Arc<Self>) {
        for lane in &self.lanes {
            if lane.is_busy() {
                continue;
            }
            let Some(item) = lock(&lane.queue).dequeue() else {
                continue;
            };

            let update = JobRunUpdate::status(JobRunStatus::Running)
                .started_at(Utc::now())
                .attempts(1);
            match self.store_call(self.store.update_job_run(item.run_id, update)).await {
                Ok(()) => {}
                Err(StoreError::RunNotFound { id }) => {
                    error!(run_id = id, job = item.job.name(), "run row vanished; dropping item");
                    self.release(item.job.name(), id);
                    continue;
                }
                Err(e) => {
                    error!(run_id = item.run_id, queue = %lane.name, "could not mark run running, re-queued: {e}");
                    lock(&lane.queue).enqueue(item);
                    continue;
                }
            }

            info!(job = item.job.name(), run_id = item.run_id, queue = %lane.name, "job started");
            let span = info_span!("job_run", job = item.job.name(), run_id = item.run_id);
            let shared = Arc::clone(self);
            let handle = tokio::spawn(async move { shared.execute(item).await }.instrument(span));
            *lock(&lane.worker) = Some(handle);
        }
    }

    /// Run attempts until one succeeds or the retry budget is spent. The run
    /// row is already `running` with `attempts = 1`.
    async fn execute(&self, item: QueueItem) {
        let job = item.job.as_ref();
        let run_id = item.run_id;
        let policy = RetryPolicy::for_job(
            job,
            self.config.retry_base_delay(),
            self.config.retry_max_delay(),
        );

        let mut attempt = 1;
        loop {
            let ctx = RunContext {
                run_id,
                job_name: job.name().to_string(),
                attempt,
            };
            match self.run_attempt(job, &ctx).await {
                Ok(output) => {
                    self.finish_success(job, run_id, output, attempt).await;
                    return;
                }
                Err(err) if policy.should_retry(attempt) => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    self.write(StoreWrite::Run(
                        job.name(),
                        run_id,
                        JobRunUpdate::status(JobRunStatus::Retrying).error(err.to_string()),
                    ))
                    .await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    self.write(StoreWrite::Run(
                        job.name(),
                        run_id,
                        JobRunUpdate::status(JobRunStatus::Running).attempts(attempt),
                    ))
                    .await;
                }
                Err(err) => {
                    self.finish_failure(job, run_id, err, attempt).await;
                    return;
                }
            }
        }
    }

    /// One bounded, panic-safe call into the job.
    async fn run_attempt(&self, job: &dyn Job, ctx: &RunContext) -> std::result::Result<Option<Value>, JobError> {
        let guarded = AssertUnwindSafe(job.run(ctx)).catch_unwind();
        match tokio::time::timeout(self.config.job_timeout(), guarded).await {
            Err(_) => Err(JobError::TimedOut {
                ms: self.config.job_timeout_ms,
            }),
            Ok(Err(panic)) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(JobResult::Success { output })) => Ok(output),
            Ok(Ok(JobResult::Failed { error })) => Err(JobError::Failed(error)),
        }
    }

    /// Schedule and definition writes land before the run row turns
    /// terminal: until then the row is outstanding and no poll can enqueue
    /// the job again.
    async fn finish_success(&self, job: &dyn Job, run_id: i64, output: Option<Value>, attempts: u32) {
        let name = job.name();
        let finished_at = Utc::now();
        self.write(StoreWrite::Status(
            name,
            JobDefinitionStatus::Active,
            Some(finished_at),
        ))
        .await;

        // The stored definition decides; fall back to the job's own metadata.
        let delay = match self.store_call(self.store.get_job_definition(name)).await {
            Ok(Some(def)) => def.next_delay(),
            Ok(None) => definition_for(job).next_delay(),
            Err(e) => {
                warn!("could not read definition, using registered metadata: {e}");
                definition_for(job).next_delay()
            }
        };

        match delay {
            Some(delay) => {
                let next_run_at = add_delay(finished_at, delay);
                self.write(StoreWrite::Schedule(ScheduledEntry::new(name, next_run_at)))
                    .await;
                info!(%next_run_at, "job rescheduled");
            }
            None => {
                self.write(StoreWrite::Unschedule(name)).await;
                debug!("one-shot job finished; schedule cleared");
            }
        }

        self.write(StoreWrite::Run(
            name,
            run_id,
            JobRunUpdate::status(JobRunStatus::Success)
                .finished_at(finished_at)
                .output(output)
                .clear_error(),
        ))
        .await;
        self.release(name, run_id);
        info!(attempts, "job succeeded");
    }

    async fn finish_failure(&self, job: &dyn Job, run_id: i64, err: JobError, attempts: u32) {
        let name = job.name();
        let finished_at = Utc::now();
        error!(attempts, error = %err, "job failed; retries exhausted, disabling");
        self.write(StoreWrite::Status(
            name,
            JobDefinitionStatus::Disabled,
            Some(finished_at),
        ))
        .await;
        self.write(StoreWrite::Unschedule(name)).await;
        self.write(StoreWrite::Run(
            name,
            run_id,
            JobRunUpdate::status(JobRunStatus::Failed)
                .finished_at(finished_at)
                .error(err.to_string()),
        ))
        .await;
        self.release(name, run_id);
    }

    fn release(&self, name: &str, run_id: i64) {
        let mut owned = lock(&self.owned);
        if owned.get(name).is_some_and(|run| run.run_id == run_id) {
            owned.remove(name);
        }
    }

    fn mark_stalled(&self, name: &str, run_id: i64) {
        if let Some(run) = lock(&self.owned).get_mut(name) {
            if run.run_id == run_id {
                run.stalled = true;
            }
        }
    }

    // --- shutdown ------------------------------------------------------------

    fn drain_queues(&self) -> usize {
        self.lanes.iter().map(|lane| lock(&lane.queue).clear()).sum()
    }

    async fn settle(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for lane in &self.lanes {
            let Some(mut handle) = lock(&lane.worker).take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(queue = %lane.name, "job task ended abnormally: {e}"),
                Err(_) => {
                    warn!(queue = %lane.name, "in-flight run did not settle in time; abandoning");
                    handle.abort();
                }
            }
        }
    }

    // --- store helpers -------------------------------------------------------

    /// Bound a store call by `store_timeout`.
    async fn store_call<T>(
        &self,
        call: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.config.store_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                ms: self.config.store_timeout_ms,
            }),
        }
    }

    async fn apply(&self, write: &StoreWrite<'_>) -> StoreResult<()> {
        match write {
            StoreWrite::Run(_, id, update) => self.store.update_job_run(*id, update.clone()).await,
            StoreWrite::Status(name, status, at) => {
                self.store.set_job_status(name, *status, *at).await
            }
            StoreWrite::Schedule(entry) => self.store.upsert_scheduled_entry(entry).await,
            StoreWrite::Unschedule(name) => self.store.remove_scheduled_entry(name).await,
        }
    }

    /// Apply `write`, retrying transient failures a tick apart. Returns
    /// whether it landed.
    ///
    /// A terminal run write is retried until it lands or the engine stops;
    /// giving up would leave the row outstanding and the job blocked.
    async fn write(&self, write: StoreWrite<'_>) -> bool {
        let terminal = match &write {
            StoreWrite::Run(name, id, update) => update
                .status
                .is_some_and(JobRunStatus::is_terminal)
                .then_some((*name, *id)),
            _ => None,
        };

        let mut attempt = 1;
        loop {
            match self.store_call(self.apply(&write)).await {
                Ok(()) => return true,
                Err(e @ StoreError::RunNotFound { .. }) => {
                    error!("store write rejected: {e}");
                    return false;
                }
                Err(e) if terminal.is_some() && !self.stopping.load(Ordering::SeqCst) => {
                    if let Some((name, id)) = terminal {
                        self.mark_stalled(name, id);
                    }
                    warn!(attempt, "run outcome not persisted, retrying next tick: {e}");
                    tokio::time::sleep(self.config.tick_interval()).await;
                    attempt += 1;
                }
                Err(e) if terminal.is_none() && attempt < STORE_WRITE_ATTEMPTS => {
                    warn!(attempt, "store write failed, retrying: {e}");
                    tokio::time::sleep(self.config.tick_interval()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, "store write abandoned: {e}");
                    return false;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::MemoryStore;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: 10,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            shutdown_grace_ms: 2_000,
            ..SchedulerConfig::default()
        }
    }

    struct Counting {
        name: &'static str,
        queue: &'static str,
        calls: Arc<AtomicU32>,
        behaviour: fn(u32) -> JobResult,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn queue(&self) -> &str {
            self.queue
        }

        fn max_retries(&self) -> u32 {
            2
        }

        async fn run(&self, ctx: &RunContext) -> JobResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behaviour)(ctx.attempt)
        }
    }

    fn engine_with(jobs: Vec<Counting>, store: Arc<MemoryStore>) -> SchedulerEngine {
        let mut registry = JobRegistry::new();
        for job in jobs {
            registry.register(job).unwrap();
        }
        SchedulerEngine::new(fast_config(), store, registry).unwrap()
    }

    #[tokio::test]
    async fn queues_are_visited_in_priority_then_name_order() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(
            vec![Counting {
                name: "Custom",
                queue: "adhoc",
                calls: Arc::default(),
                behaviour: |_| JobResult::empty(),
            }],
            store,
        );
        let order: Vec<(String, i32)> = engine
            .queue_stats()
            .into_iter()
            .map(|s| (s.name, s.priority))
            .collect();
        assert_eq!(
            order,
            vec![
                ("high".to_string(), 0),
                ("adhoc".to_string(), 5),
                ("default".to_string(), 5),
                ("low".to_string(), 10),
            ]
        );
    }

    #[tokio::test]
    async fn store_failures_skip_the_tick_without_losing_work() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(
            vec![Counting {
                name: "Ping",
                queue: "default",
                calls: Arc::clone(&calls),
                behaviour: |_| JobResult::empty(),
            }],
            Arc::clone(&store),
        );
        engine.bootstrap().await.unwrap();

        // The poll query fails: nothing enqueued, nothing executed.
        store.fail_next(1);
        engine.tick().await;
        engine.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.list_job_runs(None, 10).await.unwrap().is_empty());

        // Next tick picks the entry up normally.
        engine.tick().await;
        engine.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let runs = store.list_job_runs(Some("Ping"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobRunStatus::Success);
    }

    #[tokio::test]
    async fn failed_running_transition_requeues_the_item() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(
            vec![Counting {
                name: "Ping",
                queue: "default",
                calls: Arc::clone(&calls),
                behaviour: |_| JobResult::empty(),
            }],
            Arc::clone(&store),
        );
        engine.bootstrap().await.unwrap();

        // Only the write that marks the run running fails.
        engine.shared.poll().await;
        store.fail_next(1);
        engine.shared.dispatch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let default = engine
            .queue_stats()
            .into_iter()
            .find(|s| s.name == "default")
            .unwrap();
        assert_eq!(default.queued, 1);

        engine.shared.dispatch().await;
        engine.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_are_recorded_as_failures() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(
            vec![Counting {
                name: "Explodes",
                queue: "default",
                calls: Arc::default(),
                behaviour: |_| panic!("kaboom"),
            }],
            Arc::clone(&store),
        );
        engine.bootstrap().await.unwrap();
        engine.tick().await;
        engine.settle().await;

        let runs = store.list_job_runs(Some("Explodes"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobRunStatus::Failed);
        assert_eq!(runs[0].attempts, 2);
        assert_eq!(runs[0].error.as_deref(), Some("job panicked: kaboom"));
    }

    struct Sleepy;

    #[async_trait]
    impl Job for Sleepy {
        fn name(&self) -> &str {
            "Sleepy"
        }

        async fn run(&self, _ctx: &RunContext) -> JobResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            JobResult::empty()
        }
    }

    #[tokio::test]
    async fn slow_jobs_time_out_instead_of_hanging() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = JobRegistry::new();
        registry.register(Sleepy).unwrap();
        let config = SchedulerConfig {
            job_timeout_ms: 20,
            ..fast_config()
        };
        let engine = SchedulerEngine::new(config, store.clone(), registry).unwrap();
        engine.bootstrap().await.unwrap();
        engine.tick().await;
        engine.settle().await;

        let runs = store.list_job_runs(Some("Sleepy"), 10).await.unwrap();
        assert_eq!(runs[0].status, JobRunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("job timed out after 20ms"));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(
            vec![Counting {
                name: "Ping",
                queue: "default",
                calls: Arc::clone(&calls),
                behaviour: |_| JobResult::empty(),
            }],
            Arc::clone(&store),
        );

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running().await);

        // One-shot: exactly one execution despite many ticks.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.list_scheduled_entries().await.unwrap().is_empty());

        // Dropping the stopped engine releases its store handle.
        drop(engine);
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
