use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, info, instrument};

use super::{JobStore, StoreResult};
use crate::error::StoreError;
use crate::types::{
    format_ts, parse_ts, JobDefinition, JobDefinitionStatus, JobRun, JobRunStatus, JobRunUpdate,
    NewJobRun, ScheduledEntry,
};

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
/// Timestamps are fixed-width RFC 3339 text (see [`format_ts`]) so the
/// due-entry query can compare them as strings.
pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_definitions (
            name                TEXT    NOT NULL PRIMARY KEY,
            status              TEXT    NOT NULL DEFAULT 'pending',
            reschedule          INTEGER NOT NULL DEFAULT 0,
            reschedule_delay_ms INTEGER,            -- NULL unless reschedule = 1
            last_run_at         TEXT,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name    TEXT    NOT NULL,
            queue_name  TEXT    NOT NULL,
            priority    INTEGER NOT NULL,
            status      TEXT    NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0,
            enqueued_at TEXT    NOT NULL,
            started_at  TEXT,
            finished_at TEXT,
            output      TEXT,               -- JSON-encoded job output
            error       TEXT
        ) STRICT;

        -- Outstanding-run check: WHERE job_name = ? AND status IN (...)
        CREATE INDEX IF NOT EXISTS idx_job_runs_name_status ON job_runs (job_name, status);

        CREATE TABLE IF NOT EXISTS scheduled_entries (
            job_name    TEXT NOT NULL PRIMARY KEY,
            next_run_at TEXT NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_scheduled_entries_next_run
            ON scheduled_entries (next_run_at);
        ",
    )?;
    Ok(())
}

/// SQLite-backed [`JobStore`].
///
/// One connection behind a mutex; every call runs on the blocking pool so the
/// async runtime is never stalled by disk I/O. Each statement autocommits,
/// which makes it durable before the call returns (`synchronous = FULL`).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        info!(path = %path.as_ref().display(), "sqlite job store opened");
        Self::new(conn)
    }

    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip(self, run), fields(job = %run.job_name, queue = %run.queue_name))]
    async fn insert_job_run(&self, run: NewJobRun) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_runs (job_name, queue_name, priority, status, attempts, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    run.job_name,
                    run.queue_name,
                    run.priority,
                    JobRunStatus::Pending,
                    format_ts(run.enqueued_at),
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(run_id = id, "job run inserted");
            Ok(id)
        })
        .await
    }

    #[instrument(skip(self, update), fields(status = ?update.status))]
    async fn update_job_run(&self, id: i64, update: JobRunUpdate) -> StoreResult<()> {
        let output = update
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE job_runs SET
                    status      = COALESCE(?2, status),
                    attempts    = COALESCE(?3, attempts),
                    started_at  = COALESCE(?4, started_at),
                    finished_at = COALESCE(?5, finished_at),
                    output      = COALESCE(?6, output),
                    error       = CASE WHEN ?8 THEN NULL ELSE COALESCE(?7, error) END
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    update.status,
                    update.attempts,
                    update.started_at.map(format_ts),
                    update.finished_at.map(format_ts),
                    output,
                    update.error,
                    update.clear_error,
                ],
            )?;
            if n == 0 {
                return Err(StoreError::RunNotFound { id });
            }
            Ok(())
        })
        .await
    }

    async fn get_job_run(&self, id: i64) -> StoreResult<Option<JobRun>> {
        self.with_conn(move |conn| {
            let run = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
                    [id],
                    row_to_run,
                )
                .optional()?;
            Ok(run)
        })
        .await
    }

    async fn list_job_runs(&self, job_name: Option<&str>, limit: usize) -> StoreResult<Vec<JobRun>> {
        let job_name = job_name.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RUN_COLUMNS} FROM job_runs
                 WHERE (?1 IS NULL OR job_name = ?1)
                 ORDER BY id DESC
                 LIMIT ?2"
            ))?;
            let runs = stmt
                .query_map(rusqlite::params![job_name, limit as i64], row_to_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    async fn has_outstanding_run(&self, job_name: &str) -> StoreResult<bool> {
        let job_name = job_name.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM job_runs
                     WHERE job_name = ?1 AND status IN ('pending', 'running', 'retrying')
                     LIMIT 1",
                    [&job_name],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn recover_interrupted_runs(&self, reason: &str, at: DateTime<Utc>) -> StoreResult<usize> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE job_runs SET status = 'failed', error = ?1, finished_at = ?2
                 WHERE status IN ('pending', 'running', 'retrying')",
                rusqlite::params![reason, format_ts(at)],
            )?;
            Ok(n)
        })
        .await
    }

    #[instrument(skip(self, def), fields(job = %def.name, status = %def.status))]
    async fn upsert_job_definition(&self, def: &JobDefinition) -> StoreResult<()> {
        let def = def.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_definitions
                 (name, status, reschedule, reschedule_delay_ms, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    status              = excluded.status,
                    reschedule          = excluded.reschedule,
                    reschedule_delay_ms = excluded.reschedule_delay_ms,
                    updated_at          = excluded.updated_at",
                rusqlite::params![
                    def.name,
                    def.status,
                    def.reschedule,
                    def.reschedule_delay.map(duration_to_ms),
                    format_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job_definition(&self, name: &str) -> StoreResult<Option<JobDefinition>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let def = conn
                .query_row(
                    &format!("SELECT {DEFINITION_COLUMNS} FROM job_definitions WHERE name = ?1"),
                    [&name],
                    row_to_definition,
                )
                .optional()?;
            Ok(def)
        })
        .await
    }

    async fn list_job_definitions(&self) -> StoreResult<Vec<JobDefinition>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM job_definitions ORDER BY name"
            ))?;
            let defs = stmt
                .query_map([], row_to_definition)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(defs)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn set_job_status(
        &self,
        name: &str,
        status: JobDefinitionStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE job_definitions
                 SET status = ?2, last_run_at = COALESCE(?3, last_run_at), updated_at = ?4
                 WHERE name = ?1",
                rusqlite::params![
                    name,
                    status,
                    last_run_at.map(format_ts),
                    format_ts(Utc::now())
                ],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, entry), fields(job = %entry.job_name, next_run_at = %entry.next_run_at))]
    async fn upsert_scheduled_entry(&self, entry: &ScheduledEntry) -> StoreResult<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_entries (job_name, next_run_at) VALUES (?1, ?2)
                 ON CONFLICT(job_name) DO UPDATE SET next_run_at = excluded.next_run_at",
                rusqlite::params![entry.job_name, format_ts(entry.next_run_at)],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn remove_scheduled_entry(&self, job_name: &str) -> StoreResult<()> {
        let job_name = job_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM scheduled_entries WHERE job_name = ?1",
                [&job_name],
            )?;
            Ok(())
        })
        .await
    }

    async fn due_scheduled_entries(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT job_name, next_run_at FROM scheduled_entries WHERE next_run_at <= ?1",
            )?;
            let entries = stmt
                .query_map([format_ts(now)], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn list_scheduled_entries(&self) -> StoreResult<Vec<ScheduledEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT job_name, next_run_at FROM scheduled_entries ORDER BY next_run_at, job_name",
            )?;
            let entries = stmt
                .query_map([], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }
}

// --- row mapping ------------------------------------------------------------

const RUN_COLUMNS: &str = "id, job_name, queue_name, priority, status, attempts, \
     enqueued_at, started_at, finished_at, output, error";

const DEFINITION_COLUMNS: &str =
    "name, status, reschedule, reschedule_delay_ms, last_run_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let output = row
        .get::<_, Option<String>>(9)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(JobRun {
        id: row.get(0)?,
        job_name: row.get(1)?,
        queue_name: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        enqueued_at: ts_column(row, 6)?,
        started_at: opt_ts_column(row, 7)?,
        finished_at: opt_ts_column(row, 8)?,
        output,
        error: row.get(10)?,
    })
}

fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    Ok(JobDefinition {
        name: row.get(0)?,
        status: row.get(1)?,
        reschedule: row.get(2)?,
        reschedule_delay: row
            .get::<_, Option<i64>>(3)?
            .map(|ms| Duration::from_millis(ms.max(0) as u64)),
        last_run_at: opt_ts_column(row, 4)?,
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ScheduledEntry> {
    Ok(ScheduledEntry {
        job_name: row.get(0)?,
        next_run_at: ts_column(row, 1)?,
    })
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(&raw).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn duration_to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl ToSql for JobRunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for JobRunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for JobDefinitionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for JobDefinitionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn new_run(name: &str) -> NewJobRun {
        NewJobRun {
            job_name: name.to_string(),
            queue_name: "default".to_string(),
            priority: 5,
            enqueued_at: t(0),
        }
    }

    #[tokio::test]
    async fn run_lifecycle_is_persisted() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_job_run(new_run("Ping")).await.unwrap();

        let run = store.get_job_run(id).await.unwrap().expect("row exists");
        assert_eq!(run.status, JobRunStatus::Pending);
        assert_eq!(run.attempts, 0);
        assert_eq!(run.enqueued_at, t(0));
        assert!(store.has_outstanding_run("Ping").await.unwrap());

        store
            .update_job_run(
                id,
                JobRunUpdate::status(JobRunStatus::Running)
                    .started_at(t(1))
                    .attempts(1),
            )
            .await
            .unwrap();
        store
            .update_job_run(id, JobRunUpdate::status(JobRunStatus::Retrying).error("flaky"))
            .await
            .unwrap();
        store
            .update_job_run(
                id,
                JobRunUpdate::status(JobRunStatus::Success)
                    .finished_at(t(2))
                    .output(Some(json!({"pong": true})))
                    .clear_error(),
            )
            .await
            .unwrap();

        let run = store.get_job_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Success);
        assert_eq!(run.started_at, Some(t(1)));
        assert_eq!(run.finished_at, Some(t(2)));
        assert_eq!(run.output, Some(json!({"pong": true})));
        assert_eq!(run.error, None);
        assert!(!store.has_outstanding_run("Ping").await.unwrap());
    }

    #[tokio::test]
    async fn updating_missing_run_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update_job_run(42, JobRunUpdate::status(JobRunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { id: 42 }));
    }

    #[tokio::test]
    async fn definition_upsert_preserves_last_run_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut def = JobDefinition::new("Tick", Some(Duration::from_secs(60)));
        store.upsert_job_definition(&def).await.unwrap();
        store
            .set_job_status("Tick", JobDefinitionStatus::Active, Some(t(5)))
            .await
            .unwrap();

        def.status = JobDefinitionStatus::Pending;
        def.reschedule = false;
        def.reschedule_delay = None;
        store.upsert_job_definition(&def).await.unwrap();

        let stored = store.get_job_definition("Tick").await.unwrap().unwrap();
        assert_eq!(stored.status, JobDefinitionStatus::Pending);
        assert!(!stored.reschedule);
        assert_eq!(stored.reschedule_delay, None);
        assert_eq!(stored.last_run_at, Some(t(5)));
        assert!(store.get_job_definition("Nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduled_entries_upsert_replaces_and_due_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_scheduled_entry(&ScheduledEntry::new("A", t(10)))
            .await
            .unwrap();
        store
            .upsert_scheduled_entry(&ScheduledEntry::new("A", t(0)))
            .await
            .unwrap();
        store
            .upsert_scheduled_entry(&ScheduledEntry::new("B", t(30)))
            .await
            .unwrap();

        let all = store.list_scheduled_entries().await.unwrap();
        assert_eq!(all.len(), 2, "upsert must not duplicate");

        let due = store.due_scheduled_entries(t(0)).await.unwrap();
        assert_eq!(due, vec![ScheduledEntry::new("A", t(0))]);

        store.remove_scheduled_entry("A").await.unwrap();
        store.remove_scheduled_entry("A").await.unwrap();
        assert!(store.due_scheduled_entries(t(60)).await.unwrap().iter().all(|e| e.job_name == "B"));
    }

    #[tokio::test]
    async fn recovery_fails_every_in_flight_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pending = store.insert_job_run(new_run("A")).await.unwrap();
        let running = store.insert_job_run(new_run("B")).await.unwrap();
        let done = store.insert_job_run(new_run("C")).await.unwrap();
        store
            .update_job_run(running, JobRunUpdate::status(JobRunStatus::Running))
            .await
            .unwrap();
        store
            .update_job_run(done, JobRunUpdate::status(JobRunStatus::Success))
            .await
            .unwrap();

        let n = store
            .recover_interrupted_runs("process restarted", t(99))
            .await
            .unwrap();
        assert_eq!(n, 2);

        for id in [pending, running] {
            let run = store.get_job_run(id).await.unwrap().unwrap();
            assert_eq!(run.status, JobRunStatus::Failed);
            assert_eq!(run.error.as_deref(), Some("process restarted"));
            assert_eq!(run.finished_at, Some(t(99)));
        }
        let run = store.get_job_run(done).await.unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Success);
    }

    #[tokio::test]
    async fn list_job_runs_filters_and_orders_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a1 = store.insert_job_run(new_run("A")).await.unwrap();
        store.insert_job_run(new_run("B")).await.unwrap();
        let a2 = store.insert_job_run(new_run("A")).await.unwrap();

        let runs = store.list_job_runs(Some("A"), 10).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a2, a1]);
        assert_eq!(store.list_job_runs(None, 2).await.unwrap().len(), 2);
    }

    #[test]
    fn schema_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
