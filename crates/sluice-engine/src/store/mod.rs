//! Table store contract.
//!
//! The engine talks to the analytical store only through [`TableSession`].
//! A session is one connection: temporary tables and the open transaction
//! are scoped to it, so every step gets its own.

pub mod sqlite;

use sluice_types::schema::{ColumnDef, TableInfo};
use sluice_types::value::{Batch, Params, Value};

pub use sqlite::SqliteTableStore;

/// Errors produced by table store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Statement failure annotated with the statement that raised it.
    #[error("{message} (while running: {sql})")]
    Statement { sql: String, message: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn statement(sql: &str, err: &rusqlite::Error) -> Self {
        Self::Statement {
            sql: abbreviate(sql),
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the store module.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Factory for sessions against one database.
pub trait TableStore: Send + Sync {
    /// Open a new session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the connection cannot be established.
    fn session(&self) -> Result<Box<dyn TableSession>>;
}

/// One connection to the table store.
pub trait TableSession: Send {
    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Current shape of a table; `exists == false` when it is absent.
    fn get_schema(&self, table: &str) -> Result<TableInfo>;

    /// Result columns of a query without running it.
    ///
    /// Expression columns have no declared type and come back untyped.
    fn describe_query(&self, sql: &str) -> Result<Vec<ColumnDef>>;

    /// Run one statement, binding only the parameters it references.
    /// Returns the number of rows changed by DML statements.
    fn execute(&self, sql: &str, params: &Params) -> Result<u64>;

    fn query(&self, sql: &str, params: &Params) -> Result<Batch>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    /// Insert every row of `batch` into `table`, matching columns by name.
    fn insert_rows(&self, table: &str, batch: &Batch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let columns = column_list(batch.columns.iter().map(|c| c.name.as_str()));
        let placeholders = (0..batch.columns.len())
            .map(|i| format!(":c{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_ident(table)
        );

        let mut inserted = 0u64;
        for row in &batch.rows {
            let params: Params = row
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("c{i}"), v.clone()))
                .collect();
            inserted += self.execute(&sql, &params)?;
        }
        Ok(inserted)
    }

    /// First column of the first row, if any.
    fn query_scalar(&self, sql: &str, params: &Params) -> Result<Option<Value>> {
        let batch = self.query(sql, params)?;
        Ok(batch
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .filter(|v| !v.is_null()))
    }
}

/// Double-quote an identifier, escaping embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated quoted identifiers.
pub fn column_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column definition as written in `CREATE TABLE`.
#[must_use]
pub fn column_ddl(col: &ColumnDef) -> String {
    let mut ddl = quote_ident(&col.name);
    let ty = col.data_type.sql();
    if !ty.is_empty() {
        ddl.push(' ');
        ddl.push_str(&ty);
    }
    if !col.nullable {
        ddl.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        ddl.push_str(" DEFAULT ");
        ddl.push_str(default);
    }
    ddl
}

/// `CREATE TABLE` statement for a column set.
#[must_use]
pub fn create_table_sql(table: &str, columns: &[ColumnDef]) -> String {
    let defs = columns.iter().map(column_ddl).collect::<Vec<_>>().join(", ");
    format!("CREATE TABLE {} ({defs})", quote_ident(table))
}

/// Strip trailing semicolons so a query can be embedded as a subquery.
#[must_use]
pub fn query_body(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn abbreviate(sql: &str) -> String {
    const MAX: usize = 200;
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= MAX {
        return flat;
    }
    let mut cut = MAX;
    while !flat.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &flat[..cut])
}
