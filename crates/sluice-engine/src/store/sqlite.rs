//! Embedded `SQLite` table store.
//!
//! One connection per session. The database runs in WAL mode with a busy
//! timeout so concurrent sessions queue on the write lock instead of failing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Statement};
use sluice_types::schema::{ColumnDef, ColumnType, TableInfo};
use sluice_types::value::{Batch, Params, Value};

use super::{Result, StoreError, TableSession, TableStore};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// File-backed `SQLite` table store.
#[derive(Debug, Clone)]
pub struct SqliteTableStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteTableStore {
    /// Open or create the database at `path` and switch it to WAL mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or database can't be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteTableStore::open`] with an explicit busy timeout.
    ///
    /// # Errors
    ///
    /// See [`SqliteTableStore::open`].
    pub fn open_with_timeout(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { path, busy_timeout };
        let conn = store.connect()?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %store.path.display(), "Opened table store");
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl TableStore for SqliteTableStore {
    fn session(&self) -> Result<Box<dyn TableSession>> {
        Ok(Box::new(SqliteSession {
            conn: self.connect()?,
        }))
    }
}

/// A single `SQLite` connection.
pub struct SqliteSession {
    conn: Connection,
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

/// Bind the parameters a statement references; the rest are ignored.
fn bind(stmt: &mut Statement<'_>, params: &Params) -> rusqlite::Result<()> {
    for (name, value) in params {
        if let Some(idx) = stmt.parameter_index(&format!(":{name}"))? {
            stmt.raw_bind_parameter(idx, to_sql_value(value))?;
        }
    }
    Ok(())
}

fn describe(stmt: &Statement<'_>) -> Vec<ColumnDef> {
    stmt.columns()
        .iter()
        .map(|c| ColumnDef::new(c.name(), ColumnType::parse(c.decl_type().unwrap_or(""))))
        .collect()
}

impl TableSession for SqliteSession {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_schema(&self, table: &str) -> Result<TableInfo> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnDef {
                    name: row.get(0)?,
                    data_type: ColumnType::parse(&row.get::<_, String>(1)?),
                    nullable: row.get::<_, i64>(2)? == 0,
                    default: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if columns.is_empty() {
            return Ok(TableInfo::absent(table));
        }
        Ok(TableInfo {
            name: table.to_string(),
            columns,
            exists: true,
        })
    }

    fn describe_query(&self, sql: &str) -> Result<Vec<ColumnDef>> {
        let stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| StoreError::statement(sql, &e))?;
        Ok(describe(&stmt))
    }

    fn execute(&self, sql: &str, params: &Params) -> Result<u64> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| StoreError::statement(sql, &e))?;
        bind(&mut stmt, params).map_err(|e| StoreError::statement(sql, &e))?;
        let changed = stmt
            .raw_execute()
            .map_err(|e| StoreError::statement(sql, &e))?;
        Ok(changed as u64)
    }

    fn query(&self, sql: &str, params: &Params) -> Result<Batch> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| StoreError::statement(sql, &e))?;
        bind(&mut stmt, params).map_err(|e| StoreError::statement(sql, &e))?;
        let mut batch = Batch::new(describe(&stmt));
        let width = batch.columns.len();

        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(|e| StoreError::statement(sql, &e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            batch.rows.push(values);
        }
        Ok(batch)
    }

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SqliteTableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTableStore::open(dir.path().join("warehouse.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn schema_of_absent_table() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        assert!(!session.table_exists("nope").unwrap());
        let info = session.get_schema("nope").unwrap();
        assert!(!info.exists);
        assert!(info.columns.is_empty());
    }

    #[test]
    fn schema_reports_types_nullability_and_defaults() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        session
            .execute(
                "CREATE TABLE t (id INT4 NOT NULL, name VARCHAR(20) DEFAULT 'x', at DATETIME)",
                &Params::new(),
            )
            .unwrap();

        let info = session.get_schema("T").unwrap();
        assert!(info.exists);
        assert_eq!(info.columns[0].data_type, ColumnType::Integer);
        assert!(!info.columns[0].nullable);
        assert_eq!(info.columns[1].data_type, ColumnType::Varchar(20));
        assert_eq!(info.columns[1].default.as_deref(), Some("'x'"));
        assert_eq!(info.columns[2].data_type, ColumnType::Timestamp);
        assert!(session.table_exists("t").unwrap());
    }

    #[test]
    fn describe_query_leaves_expressions_untyped() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        session
            .execute("CREATE TABLE t (id BIGINT, v TEXT)", &Params::new())
            .unwrap();
        let cols = session
            .describe_query("SELECT id, v, id + 1 AS next FROM t")
            .unwrap();
        assert_eq!(cols[0].data_type, ColumnType::BigInt);
        assert_eq!(cols[1].data_type, ColumnType::Text);
        assert_eq!(cols[2].name, "next");
        assert!(cols[2].data_type.is_untyped());
    }

    #[test]
    fn only_referenced_params_are_bound() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        let mut params = Params::new();
        params.insert("lo".into(), Value::Integer(2));
        params.insert("unused".into(), Value::Text("ignored".into()));
        let batch = session
            .query(
                "SELECT value FROM (SELECT 1 AS value UNION ALL SELECT 3) WHERE value >= :lo",
                &params,
            )
            .unwrap();
        assert_eq!(batch.rows, vec![vec![Value::Integer(3)]]);
    }

    #[test]
    fn insert_rows_and_rollback() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        session
            .execute("CREATE TABLE t (id INTEGER, v TEXT)", &Params::new())
            .unwrap();

        let mut batch = Batch::new(vec![ColumnDef::new("id", "INTEGER"), ColumnDef::new("v", "TEXT")]);
        batch.rows.push(vec![Value::Integer(1), Value::Text("a".into())]);
        batch.rows.push(vec![Value::Integer(2), Value::Null]);

        session.begin().unwrap();
        assert_eq!(session.insert_rows("t", &batch).unwrap(), 2);
        session.rollback().unwrap();

        let count = session
            .query_scalar("SELECT COUNT(*) FROM t", &Params::new())
            .unwrap();
        assert_eq!(count, Some(Value::Integer(0)));
    }

    #[test]
    fn statement_errors_carry_sql() {
        let (_dir, store) = store();
        let session = store.session().unwrap();
        let err = session
            .execute("INSERT INTO missing VALUES (1)", &Params::new())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no such table"), "got: {msg}");
        assert!(msg.contains("INSERT INTO missing"), "got: {msg}");
    }

    #[test]
    fn sessions_see_each_others_commits() {
        let (_dir, store) = store();
        let a = store.session().unwrap();
        let b = store.session().unwrap();
        a.execute("CREATE TABLE t (id INTEGER)", &Params::new()).unwrap();
        a.begin().unwrap();
        a.execute("INSERT INTO t VALUES (1)", &Params::new()).unwrap();
        a.commit().unwrap();
        let n = b.query_scalar("SELECT COUNT(*) FROM t", &Params::new()).unwrap();
        assert_eq!(n, Some(Value::Integer(1)));
    }
}
