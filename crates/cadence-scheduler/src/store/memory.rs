use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobStore, StoreResult};
use crate::error::StoreError;
use crate::types::{
    JobDefinition, JobDefinitionStatus, JobRun, JobRunStatus, JobRunUpdate, NewJobRun,
    ScheduledEntry,
};

/// In-process [`JobStore`] for tests and ephemeral runs.
///
/// Besides the contract it records the sequence of statuses each run passed
/// through and can be told to fail the next N calls, so engine behaviour
/// under store faults can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    definitions: BTreeMap<String, JobDefinition>,
    runs: Vec<JobRun>,
    entries: BTreeMap<String, DateTime<Utc>>,
    history: HashMap<i64, Vec<JobRunStatus>>,
    failures_remaining: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failures_remaining = count;
        }
    }

    /// Every status a run has held, in order, starting with `Pending`.
    pub fn status_history(&self, run_id: i64) -> Vec<JobRunStatus> {
        self.state
            .lock()
            .map(|state| state.history.get(&run_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Lock the state, consuming one injected failure if any are armed.
    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job_run(&self, run: NewJobRun) -> StoreResult<i64> {
        let mut state = self.state()?;
        let id = state.runs.len() as i64 + 1;
        state.runs.push(JobRun {
            id,
            job_name: run.job_name,
            queue_name: run.queue_name,
            priority: run.priority,
            status: JobRunStatus::Pending,
            attempts: 0,
            enqueued_at: run.enqueued_at,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        });
        state.history.insert(id, vec![JobRunStatus::Pending]);
        Ok(id)
    }

    async fn update_job_run(&self, id: i64, update: JobRunUpdate) -> StoreResult<()> {
        let mut state = self.state()?;
        let run = usize::try_from(id - 1)
            .ok()
            .and_then(|idx| state.runs.get_mut(idx))
            .ok_or(StoreError::RunNotFound { id })?;
        update.apply_to(run);
        if let Some(status) = update.status {
            state.history.entry(id).or_default().push(status);
        }
        Ok(())
    }

    async fn get_job_run(&self, id: i64) -> StoreResult<Option<JobRun>> {
        let state = self.state()?;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_job_runs(&self, job_name: Option<&str>, limit: usize) -> StoreResult<Vec<JobRun>> {
        let state = self.state()?;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| job_name.map_or(true, |name| r.job_name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn has_outstanding_run(&self, job_name: &str) -> StoreResult<bool> {
        let state = self.state()?;
        Ok(state
            .runs
            .iter()
            .any(|r| r.job_name == job_name && JobRunStatus::IN_FLIGHT.contains(&r.status)))
    }

    async fn recover_interrupted_runs(&self, reason: &str, at: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state()?;
        let state = &mut *state;
        let mut count = 0;
        for run in state
            .runs
            .iter_mut()
            .filter(|r| JobRunStatus::IN_FLIGHT.contains(&r.status))
        {
            run.status = JobRunStatus::Failed;
            run.error = Some(reason.to_string());
            run.finished_at = Some(at);
            state
                .history
                .entry(run.id)
                .or_default()
                .push(JobRunStatus::Failed);
            count += 1;
        }
        Ok(count)
    }

    async fn upsert_job_definition(&self, def: &JobDefinition) -> StoreResult<()> {
        let mut state = self.state()?;
        state
            .definitions
            .entry(def.name.clone())
            .and_modify(|existing| {
                existing.status = def.status;
                existing.reschedule = def.reschedule;
                existing.reschedule_delay = def.reschedule_delay;
            })
            .or_insert_with(|| JobDefinition {
                last_run_at: None,
                ..def.clone()
            });
        Ok(())
    }

    async fn get_job_definition(&self, name: &str) -> StoreResult<Option<JobDefinition>> {
        let state = self.state()?;
        Ok(state.definitions.get(name).cloned())
    }

    async fn list_job_definitions(&self) -> StoreResult<Vec<JobDefinition>> {
        let state = self.state()?;
        Ok(state.definitions.values().cloned().collect())
    }

    async fn set_job_status(
        &self,
        name: &str,
        status: JobDefinitionStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state()?;
        if let Some(def) = state.definitions.get_mut(name) {
            def.status = status;
            if last_run_at.is_some() {
                def.last_run_at = last_run_at;
            }
        }
        Ok(())
    }

    async fn upsert_scheduled_entry(&self, entry: &ScheduledEntry) -> StoreResult<()> {
        let mut state = self.state()?;
        state
            .entries
            .insert(entry.job_name.clone(), entry.next_run_at);
        Ok(())
    }

    async fn remove_scheduled_entry(&self, job_name: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        state.entries.remove(job_name);
        Ok(())
    }

    async fn due_scheduled_entries(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledEntry>> {
        let state = self.state()?;
        Ok(state
            .entries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, at)| ScheduledEntry::new(name.clone(), *at))
            .collect())
    }

    async fn list_scheduled_entries(&self) -> StoreResult<Vec<ScheduledEntry>> {
        let state = self.state()?;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .map(|(name, at)| ScheduledEntry::new(name.clone(), *at))
            .collect();
        entries.sort_by(|a, b| (a.next_run_at, &a.job_name).cmp(&(b.next_run_at, &b.job_name)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(name: &str) -> NewJobRun {
        NewJobRun {
            job_name: name.to_string(),
            queue_name: "default".to_string(),
            priority: 5,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_tracks_every_transition() {
        let store = MemoryStore::new();
        let id = store.insert_job_run(new_run("A")).await.unwrap();
        store
            .update_job_run(id, JobRunUpdate::status(JobRunStatus::Running))
            .await
            .unwrap();
        store
            .update_job_run(id, JobRunUpdate::default().attempts(2))
            .await
            .unwrap();
        store
            .update_job_run(id, JobRunUpdate::status(JobRunStatus::Success))
            .await
            .unwrap();

        assert_eq!(
            store.status_history(id),
            vec![
                JobRunStatus::Pending,
                JobRunStatus::Running,
                JobRunStatus::Success
            ]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(matches!(
            store.list_scheduled_entries().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.insert_job_run(new_run("A")).await.is_err());
        assert!(store.insert_job_run(new_run("A")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_run_update_is_not_found() {
        let store = MemoryStore::new();
        for id in [0, 5, -3] {
            let err = store
                .update_job_run(id, JobRunUpdate::status(JobRunStatus::Failed))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::RunNotFound { .. }));
        }
    }
}
