//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sluice_engine::store::{SqliteTableStore, TableStore};
use sluice_engine::{InMemorySink, Orchestrator};
use sluice_state::SqliteStateStore;
use sluice_types::value::{Params, Value};

pub const PIPELINE: &str = "test_pipeline";

/// Table store and state store in one temporary directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<SqliteTableStore>,
    pub state: Arc<SqliteStateStore>,
    pub metrics: Arc<InMemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteTableStore::open(dir.path().join("warehouse.db")).unwrap());
        let state = Arc::new(SqliteStateStore::open(&dir.path().join("state.db")).unwrap());
        Self {
            dir,
            store,
            state,
            metrics: Arc::new(InMemorySink::new()),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(PIPELINE, self.store.clone(), self.state.clone())
            .with_metrics_sink(self.metrics.clone())
    }

    /// Run each statement in its own autocommit call.
    pub fn exec(&self, statements: &[&str]) {
        let session = self.store.session().unwrap();
        for sql in statements {
            session.execute(sql, &Params::new()).unwrap();
        }
    }

    pub fn rows(&self, sql: &str) -> Vec<Vec<Value>> {
        self.store
            .session()
            .unwrap()
            .query(sql, &Params::new())
            .unwrap()
            .rows
    }

    pub fn count(&self, table: &str) -> i64 {
        match self.rows(&format!("SELECT COUNT(*) FROM \"{table}\""))[0][0] {
            Value::Integer(n) => n,
            ref other => panic!("unexpected count {other:?}"),
        }
    }

    /// `name TYPE` per column, in table order.
    pub fn store_schema(&self, table: &str) -> Vec<String> {
        self.store
            .session()
            .unwrap()
            .get_schema(table)
            .unwrap()
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type.sql()))
            .collect()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.store.session().unwrap().table_exists(table).unwrap()
    }
}

pub fn int(v: i64) -> Value {
    Value::Integer(v)
}

pub fn text(v: &str) -> Value {
    Value::from(v)
}
