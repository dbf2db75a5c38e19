//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. The database file may
//! be shared with the table store; WAL mode and a busy timeout keep the two
//! from tripping over each other.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use sluice_types::schema::ColumnDef;
use sluice_types::state::{
    PipelineId, RunRecord, RunStats, RunStatus, StepRunRecord, Watermark, WatermarkKey,
};

use crate::error::{self, StateError};
use crate::store::StateStore;

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sluice_watermarks (
    pipeline_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    cursor_column TEXT NOT NULL,
    cursor_value TEXT NOT NULL,
    last_updated TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline_name, table_name, cursor_column)
);

CREATE TABLE IF NOT EXISTS sluice_schema_snapshots (
    table_name TEXT PRIMARY KEY,
    columns_json TEXT NOT NULL,
    captured_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sluice_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    steps_succeeded INTEGER DEFAULT 0,
    steps_failed INTEGER DEFAULT 0,
    steps_skipped INTEGER DEFAULT 0,
    steps_pending INTEGER DEFAULT 0,
    rows_affected INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS sluice_step_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES sluice_runs(id),
    step_id TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_secs REAL NOT NULL,
    rows_affected INTEGER NOT NULL DEFAULT 0,
    error_kind TEXT,
    error_message TEXT,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_step_runs_run ON sluice_step_runs (run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence
/// or [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or a backend error if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteStateStore::open`] with an explicit busy timeout.
    ///
    /// # Errors
    ///
    /// See [`SqliteStateStore::open`].
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| StateError::backend_context("open: busy_timeout", e))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StateError::backend_context("open: journal_mode", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        tracing::debug!(path = %path.display(), "Opened state store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns a backend error if the in-memory database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Decode a snake_case enum stored as TEXT.
    fn parse_label<T: DeserializeOwned>(raw: String) -> error::Result<T> {
        Ok(serde_json::from_value(serde_json::Value::String(raw))?)
    }

    fn watermark_from_row(key: WatermarkKey, value: String, updated: &str) -> Watermark {
        Watermark {
            key,
            value,
            last_updated: Self::sqlite_to_iso8601(updated),
        }
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl StateStore for SqliteStateStore {
    fn get_watermark(&self, key: &WatermarkKey) -> error::Result<Option<Watermark>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT cursor_value, last_updated FROM sluice_watermarks \
                 WHERE pipeline_name = ?1 AND table_name = ?2 AND cursor_column = ?3",
                rusqlite::params![key.pipeline.as_str(), key.table, key.cursor_column],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_watermark", e))?;

        Ok(row.map(|(value, updated)| Self::watermark_from_row(key.clone(), value, &updated)))
    }

    fn put_watermark(&self, key: &WatermarkKey, value: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sluice_watermarks \
             (pipeline_name, table_name, cursor_column, cursor_value, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pipeline_name, table_name, cursor_column) \
             DO UPDATE SET cursor_value = ?4, last_updated = ?5",
            rusqlite::params![
                key.pipeline.as_str(),
                key.table,
                key.cursor_column,
                value,
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StateError::backend_context("put_watermark", e))?;
        Ok(())
    }

    fn compare_and_set_watermark(
        &self,
        key: &WatermarkKey,
        expected: Option<&str>,
        new_value: &str,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let now = Self::now_sqlite();

        let rows_affected = match expected {
            Some(expected_val) => conn
                .execute(
                    "UPDATE sluice_watermarks SET cursor_value = ?1, last_updated = ?2 \
                     WHERE pipeline_name = ?3 AND table_name = ?4 AND cursor_column = ?5 \
                     AND cursor_value = ?6",
                    rusqlite::params![
                        new_value,
                        now,
                        key.pipeline.as_str(),
                        key.table,
                        key.cursor_column,
                        expected_val
                    ],
                )
                .map_err(|e| StateError::backend_context("compare_and_set: update", e))?,
            None => conn
                .execute(
                    "INSERT OR IGNORE INTO sluice_watermarks \
                     (pipeline_name, table_name, cursor_column, cursor_value, last_updated) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        key.pipeline.as_str(),
                        key.table,
                        key.cursor_column,
                        new_value,
                        now
                    ],
                )
                .map_err(|e| StateError::backend_context("compare_and_set: insert", e))?,
        };

        Ok(rows_affected > 0)
    }

    fn list_watermarks(&self, pipeline: &PipelineId) -> error::Result<Vec<Watermark>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT table_name, cursor_column, cursor_value, last_updated \
                 FROM sluice_watermarks WHERE pipeline_name = ?1 \
                 ORDER BY table_name, cursor_column",
            )
            .map_err(|e| StateError::backend_context("list_watermarks: prepare", e))?;
        let rows = stmt
            .query_map([pipeline.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_watermarks: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (table, column, value, updated) = row.map_err(StateError::backend)?;
            let key = WatermarkKey::new(pipeline.clone(), table, column);
            out.push(Self::watermark_from_row(key, value, &updated));
        }
        Ok(out)
    }

    fn put_schema_snapshot(&self, table: &str, columns: &[ColumnDef]) -> error::Result<()> {
        let json = serde_json::to_string(columns)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sluice_schema_snapshots (table_name, columns_json, captured_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(table_name) DO UPDATE SET columns_json = ?2, captured_at = ?3",
            rusqlite::params![table, json, Self::now_sqlite()],
        )
        .map_err(|e| StateError::backend_context("put_schema_snapshot", e))?;
        Ok(())
    }

    fn get_schema_snapshot(&self, table: &str) -> error::Result<Option<Vec<ColumnDef>>> {
        let raw: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT columns_json FROM sluice_schema_snapshots WHERE table_name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_schema_snapshot", e))?
        };
        raw.map(|json| serde_json::from_str(&json).map_err(StateError::from))
            .transpose()
    }

    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sluice_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sluice_runs SET status = ?1, finished_at = datetime('now'), \
             steps_succeeded = ?2, steps_failed = ?3, steps_skipped = ?4, steps_pending = ?5, \
             rows_affected = ?6, error_message = ?7 WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                stats.steps_succeeded as i64,
                stats.steps_failed as i64,
                stats.steps_skipped as i64,
                stats.steps_pending as i64,
                stats.rows_affected as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    fn record_step(&self, run_id: i64, step: &StepRunRecord) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sluice_step_runs \
             (run_id, step_id, status, duration_secs, rows_affected, error_kind, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                run_id,
                step.step_id.as_str(),
                step.status.as_str(),
                step.duration_secs,
                step.rows_affected as i64,
                step.error_kind.map(|k| k.as_str()),
                step.error_message,
            ],
        )
        .map_err(|e| StateError::backend_context("record_step", e))?;
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT pipeline, status, started_at, finished_at, steps_succeeded, \
                 steps_failed, steps_skipped, steps_pending, rows_affected, error_message \
                 FROM sluice_runs WHERE id = ?1",
                [run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        [
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                        ],
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_run", e))?;

        let Some((pipeline, status, started, finished, counts, error_message)) = row else {
            return Ok(None);
        };
        Ok(Some(RunRecord {
            id: run_id,
            pipeline: PipelineId::new(pipeline),
            status: Self::parse_label(status)?,
            started_at: Self::sqlite_to_iso8601(&started),
            finished_at: finished.as_deref().map(Self::sqlite_to_iso8601),
            stats: RunStats {
                steps_succeeded: counts[0] as u64,
                steps_failed: counts[1] as u64,
                steps_skipped: counts[2] as u64,
                steps_pending: counts[3] as u64,
                rows_affected: counts[4] as u64,
                error_message,
            },
        }))
    }

    fn list_step_runs(&self, run_id: i64) -> error::Result<Vec<StepRunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT step_id, status, duration_secs, rows_affected, error_kind, error_message \
                 FROM sluice_step_runs WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("list_step_runs: prepare", e))?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_step_runs: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (step_id, status, duration_secs, rows_affected, error_kind, error_message) =
                row.map_err(StateError::backend)?;
            out.push(StepRunRecord {
                step_id: step_id.into(),
                status: Self::parse_label(status)?,
                duration_secs,
                rows_affected: rows_affected as u64,
                error_kind: error_kind.map(Self::parse_label).transpose()?,
                error_message,
            });
        }
        Ok(out)
    }
}
