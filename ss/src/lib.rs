//! Persistent execution history for rushti runs.
//!
//! One row per run, one row per (run, task). The orchestrator appends
//! records as tasks finalize and reads recent history back to weight the
//! ready queue and to feed the contention analyzer. A single SQLite file
//! is the backing store; writes are serialized through one connection.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Summary row for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Lexicographically increasing run identifier (timestamp-derived)
    pub run_id: String,
    /// Workflow name
    pub workflow: String,
    /// Unix milliseconds
    pub started_at: i64,
    /// Unix milliseconds
    pub finished_at: i64,
    /// Worker cap the run executed with
    pub max_workers: u32,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub cancelled: u32,
    /// True when every task finalized as succeeded or skipped-by-policy
    pub success: bool,
}

impl RunRecord {
    /// Wall-clock duration in seconds
    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at) as f64 / 1000.0
    }
}

/// One task execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: String,
    pub workflow: String,
    pub task_id: String,
    /// Canonical identity correlating executions across runs
    pub signature: String,
    pub instance: String,
    pub process: String,
    /// JSON object of parameter name -> value
    pub parameters: String,
    /// Terminal status, snake_case
    pub status: String,
    /// Unix milliseconds; None when the task never started
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl TaskRecord {
    /// Observed duration in seconds, when both timestamps are known
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) if f >= s => Some((f - s) as f64 / 1000.0),
            _ => None,
        }
    }
}

/// A successful duration observation for one signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationSample {
    pub duration_secs: f64,
    /// Unix milliseconds of the task start
    pub started_at: i64,
}

/// SQLite-backed history store. Cheap to share behind an `Arc`; all
/// access goes through one connection guarded by a mutex.
pub struct StatsStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    workflow    TEXT NOT NULL,
    started_at  INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    max_workers INTEGER NOT NULL,
    total       INTEGER NOT NULL,
    succeeded   INTEGER NOT NULL,
    failed      INTEGER NOT NULL,
    skipped     INTEGER NOT NULL,
    cancelled   INTEGER NOT NULL,
    success     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow, run_id);

CREATE TABLE IF NOT EXISTS task_runs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        TEXT NOT NULL,
    workflow      TEXT NOT NULL,
    task_id       TEXT NOT NULL,
    signature     TEXT NOT NULL,
    instance      TEXT NOT NULL,
    process       TEXT NOT NULL,
    parameters    TEXT NOT NULL,
    status        TEXT NOT NULL,
    started_at    INTEGER,
    finished_at   INTEGER,
    attempts      INTEGER NOT NULL,
    error_kind    TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_runs_signature ON task_runs(signature, started_at);
CREATE INDEX IF NOT EXISTS idx_task_runs_workflow ON task_runs(workflow, run_id);
"#;

impl StatsStore {
    /// Open (creating if necessary) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open stats db at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("Failed to create stats schema")?;
        debug!(path = %path.display(), "Stats store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory stats db")?;
        conn.execute_batch(SCHEMA).context("Failed to create stats schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a writer panicked mid-statement; the
        // connection itself is still usable for append-only work.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append the summary row for a finished run.
    pub fn append_run(&self, rec: &RunRecord) -> Result<()> {
        self.lock()
            .execute(
                r#"
                INSERT INTO runs (run_id, workflow, started_at, finished_at, max_workers,
                                  total, succeeded, failed, skipped, cancelled, success)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    rec.run_id,
                    rec.workflow,
                    rec.started_at,
                    rec.finished_at,
                    rec.max_workers,
                    rec.total,
                    rec.succeeded,
                    rec.failed,
                    rec.skipped,
                    rec.cancelled,
                    rec.success as i64,
                ],
            )
            .context("Failed to insert run record")?;
        Ok(())
    }

    /// Append one task execution row.
    pub fn append_task(&self, rec: &TaskRecord) -> Result<()> {
        self.lock()
            .execute(
                r#"
                INSERT INTO task_runs (run_id, workflow, task_id, signature, instance, process,
                                       parameters, status, started_at, finished_at, attempts,
                                       error_kind, error_message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    rec.run_id,
                    rec.workflow,
                    rec.task_id,
                    rec.signature,
                    rec.instance,
                    rec.process,
                    rec.parameters,
                    rec.status,
                    rec.started_at,
                    rec.finished_at,
                    rec.attempts,
                    rec.error_kind,
                    rec.error_message,
                ],
            )
            .context("Failed to insert task record")?;
        Ok(())
    }

    /// Last `k` successful durations for a signature, most recent first.
    pub fn recent(&self, signature: &str, k: usize) -> Result<Vec<DurationSample>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT started_at, finished_at FROM task_runs
            WHERE signature = ?1 AND status = 'succeeded'
              AND started_at IS NOT NULL AND finished_at IS NOT NULL
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![signature, k as i64], |row| {
            let started: i64 = row.get(0)?;
            let finished: i64 = row.get(1)?;
            Ok(DurationSample {
                duration_secs: (finished - started) as f64 / 1000.0,
                started_at: started,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Last `k` run summaries for a workflow, most recent first.
    pub fn recent_runs(&self, workflow: &str, k: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, workflow, started_at, finished_at, max_workers,
                   total, succeeded, failed, skipped, cancelled, success
            FROM runs WHERE workflow = ?1
            ORDER BY run_id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![workflow, k as i64], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every task row belonging to the last `lookback_runs` runs of a workflow.
    pub fn task_history(&self, workflow: &str, lookback_runs: usize) -> Result<Vec<TaskRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, workflow, task_id, signature, instance, process, parameters,
                   status, started_at, finished_at, attempts, error_kind, error_message
            FROM task_runs
            WHERE workflow = ?1 AND run_id IN (
                SELECT run_id FROM runs WHERE workflow = ?1 ORDER BY run_id DESC LIMIT ?2
            )
            ORDER BY run_id, task_id
            "#,
        )?;
        let rows = stmt.query_map(params![workflow, lookback_runs as i64], row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent run of a workflow, if any.
    pub fn last_run(&self, workflow: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                r#"
                SELECT run_id, workflow, started_at, finished_at, max_workers,
                       total, succeeded, failed, skipped, cancelled, success
                FROM runs WHERE workflow = ?1
                ORDER BY run_id DESC LIMIT 1
                "#,
                params![workflow],
                row_to_run,
            )
            .optional()?;
        Ok(rec)
    }

    /// Drop records older than `days` (both tables). 0 disables retention.
    /// Returns the number of task rows removed.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;
        let conn = self.lock();
        let tasks = conn.execute(
            "DELETE FROM task_runs WHERE started_at IS NOT NULL AND started_at < ?1",
            params![cutoff],
        )?;
        let runs = conn.execute("DELETE FROM runs WHERE started_at < ?1", params![cutoff])?;
        if tasks + runs > 0 {
            info!(tasks, runs, days, "Purged aged history");
        }
        Ok(tasks)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        workflow: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        max_workers: row.get(4)?,
        total: row.get(5)?,
        succeeded: row.get(6)?,
        failed: row.get(7)?,
        skipped: row.get(8)?,
        cancelled: row.get(9)?,
        success: row.get::<_, i64>(10)? != 0,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        run_id: row.get(0)?,
        workflow: row.get(1)?,
        task_id: row.get(2)?,
        signature: row.get(3)?,
        instance: row.get(4)?,
        process: row.get(5)?,
        parameters: row.get(6)?,
        status: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        attempts: row.get(10)?,
        error_kind: row.get(11)?,
        error_message: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(run_id: &str, task_id: &str, sig: &str, start: i64, dur_ms: i64, status: &str) -> TaskRecord {
        TaskRecord {
            run_id: run_id.to_string(),
            workflow: "wf".to_string(),
            task_id: task_id.to_string(),
            signature: sig.to_string(),
            instance: "prod".to_string(),
            process: "load".to_string(),
            parameters: "{}".to_string(),
            status: status.to_string(),
            started_at: Some(start),
            finished_at: Some(start + dur_ms),
            attempts: 1,
            error_kind: None,
            error_message: None,
        }
    }

    fn run(run_id: &str, started: i64, workers: u32) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            workflow: "wf".to_string(),
            started_at: started,
            finished_at: started + 60_000,
            max_workers: workers,
            total: 3,
            succeeded: 3,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            success: true,
        }
    }

    #[test]
    fn test_recent_orders_newest_first_and_skips_failures() {
        let store = StatsStore::open_in_memory().unwrap();
        store.append_task(&task("r1", "t", "sig-a", 1_000, 2_000, "succeeded")).unwrap();
        store.append_task(&task("r2", "t", "sig-a", 5_000, 4_000, "succeeded")).unwrap();
        store.append_task(&task("r3", "t", "sig-a", 9_000, 8_000, "failed")).unwrap();
        store.append_task(&task("r3", "u", "sig-b", 9_000, 1_000, "succeeded")).unwrap();

        let samples = store.recent("sig-a", 10).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].started_at, 5_000);
        assert!((samples[0].duration_secs - 4.0).abs() < 1e-9);
        assert!((samples[1].duration_secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_recent_respects_limit() {
        let store = StatsStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .append_task(&task(&format!("r{i}"), "t", "sig", i * 1_000, 1_000, "succeeded"))
                .unwrap();
        }
        assert_eq!(store.recent("sig", 3).unwrap().len(), 3);
    }

    #[test]
    fn test_recent_runs_and_last_run() {
        let store = StatsStore::open_in_memory().unwrap();
        store.append_run(&run("20240101120000000", 1_000, 2)).unwrap();
        store.append_run(&run("20240102120000000", 2_000, 4)).unwrap();

        let runs = store.recent_runs("wf", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "20240102120000000");
        assert_eq!(runs[0].max_workers, 4);

        let last = store.last_run("wf").unwrap().unwrap();
        assert_eq!(last.run_id, "20240102120000000");
        assert!(store.last_run("other").unwrap().is_none());
    }

    #[test]
    fn test_task_history_limits_to_lookback_runs() {
        let store = StatsStore::open_in_memory().unwrap();
        for (i, rid) in ["r1", "r2", "r3"].iter().enumerate() {
            store.append_run(&run(rid, i as i64 * 1_000, 2)).unwrap();
            store.append_task(&task(rid, "t", "sig", i as i64 * 1_000, 500, "succeeded")).unwrap();
        }
        let history = store.task_history("wf", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.run_id == "r2" || t.run_id == "r3"));
    }

    #[test]
    fn test_purge_zero_is_unbounded() {
        let store = StatsStore::open_in_memory().unwrap();
        store.append_task(&task("r1", "t", "sig", 1_000, 1_000, "succeeded")).unwrap();
        assert_eq!(store.purge_older_than(0).unwrap(), 0);
        assert_eq!(store.recent("sig", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_removes_aged_rows() {
        let store = StatsStore::open_in_memory().unwrap();
        let now = Utc::now().timestamp_millis();
        store.append_task(&task("old", "t", "sig", now - 90 * 86_400_000, 1_000, "succeeded")).unwrap();
        store.append_task(&task("new", "t", "sig", now - 1_000, 1_000, "succeeded")).unwrap();

        let removed = store.purge_older_than(30).unwrap();
        assert_eq!(removed, 1);
        let samples = store.recent("sig", 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].started_at, now - 1_000);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stats.sqlite");
        let store = StatsStore::open(&path).unwrap();
        store.append_run(&run("r1", 1_000, 1)).unwrap();
        drop(store);

        let reopened = StatsStore::open(&path).unwrap();
        assert_eq!(reopened.recent_runs("wf", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_duration_secs_requires_both_timestamps() {
        let mut rec = task("r", "t", "s", 1_000, 500, "failed");
        assert_eq!(rec.duration_secs(), Some(0.5));
        rec.finished_at = None;
        assert_eq!(rec.duration_secs(), None);
    }
}
