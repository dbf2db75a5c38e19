//! End-to-end plans: CSV load, transforms and export driven from a plan
//! document.

mod common;

use std::sync::Arc;

use common::{int, text};
use sluice_connectors::{CsvSink, CsvSource, CSV_SCHEME};
use sluice_engine::config::parse_config_str;
use sluice_engine::store::{SqliteTableStore, TableStore};
use sluice_engine::{check_pipeline, run_pipeline, ConnectorRegistry, EngineConfig};
use sluice_state::{SqliteStateStore, StateStore};
use sluice_types::metric::StepStatus;
use sluice_types::state::PipelineId;
use sluice_types::value::{Params, Value};
use tokio_util::sync::CancellationToken;

fn registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register_source(CSV_SCHEME, Arc::new(CsvSource::new()));
    registry.register_sink(CSV_SCHEME, Arc::new(CsvSink::new()));
    registry
}

fn plan(dir: &std::path::Path) -> EngineConfig {
    let input = dir.join("orders.csv");
    std::fs::write(&input, "id,customer,amount\n1,ada,10.5\n2,bob,\n3,cy,7\n").unwrap();

    let yaml = format!(
        r#"
version: "1.0"
pipeline: orders
store:
  path: {db}
state:
  path: {state}
execution:
  failure_policy: fail_fast
  max_parallelism: 2
steps:
  - id: load_orders
    type: load
    target: raw_orders
    source: csv:{input}
  - id: orders
    type: transform
    target: orders
    sql: SELECT id, customer, amount FROM raw_orders
    depends_on: [load_orders]
  - id: history
    type: transform
    target: order_history
    mode: append
    sql: SELECT id, customer FROM orders
    depends_on: [orders]
  - id: export_totals
    type: export
    target: csv:{out}
    sql: SELECT customer, amount FROM orders ORDER BY id
    depends_on: [orders]
"#,
        db = dir.join("warehouse.db").display(),
        state = dir.join("state.db").display(),
        input = input.display(),
        out = dir.join("out/totals.csv").display(),
    );
    parse_config_str(&yaml).unwrap()
}

fn rows(config: &EngineConfig, sql: &str) -> Vec<Vec<Value>> {
    SqliteTableStore::open(&config.store.path)
        .unwrap()
        .session()
        .unwrap()
        .query(sql, &Params::new())
        .unwrap()
        .rows
}

#[tokio::test]
async fn csv_load_transform_append_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = plan(dir.path());

    let first = run_pipeline(&config, registry(), CancellationToken::new())
        .await
        .unwrap();
    assert!(first.success, "{first:?}");
    assert_eq!(first.step("load_orders").unwrap().rows_affected(), 3);
    assert_eq!(first.step("export_totals").unwrap().rows_affected(), 3);

    assert_eq!(
        rows(&config, "SELECT id, customer, amount FROM orders ORDER BY id"),
        vec![
            vec![int(1), text("ada"), Value::Real(10.5)],
            vec![int(2), text("bob"), Value::Null],
            vec![int(3), text("cy"), Value::Real(7.0)],
        ]
    );

    let exported = std::fs::read_to_string(dir.path().join("out/totals.csv")).unwrap();
    assert_eq!(exported, "customer,amount\nada,10.5\nbob,\ncy,7\n");

    // REPLACE targets stay put, the APPEND target doubles.
    let second = run_pipeline(&config, registry(), CancellationToken::new())
        .await
        .unwrap();
    assert!(second.success, "{second:?}");
    assert_eq!(rows(&config, "SELECT COUNT(*) FROM orders"), vec![vec![int(3)]]);
    assert_eq!(rows(&config, "SELECT COUNT(*) FROM order_history"), vec![vec![int(6)]]);

    let state = SqliteStateStore::open(config.state_path()).unwrap();
    let run = state.get_run(second.run_id).unwrap().unwrap();
    assert_eq!(run.pipeline, PipelineId::new("orders"));
    assert_eq!(run.stats.steps_succeeded, 4);
}

#[tokio::test]
async fn unregistered_source_fails_the_load_step() {
    let dir = tempfile::tempdir().unwrap();
    let config = plan(dir.path());

    let result = run_pipeline(&config, ConnectorRegistry::new(), CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    let load = result.step("load_orders").unwrap();
    assert_eq!(load.status, StepStatus::Failed);
    assert!(load.failure().unwrap().message.contains("csv"));
    assert_eq!(result.step("orders").unwrap().status, StepStatus::Pending);
}

#[test]
fn check_reports_order_and_unresolved_connectors() {
    let dir = tempfile::tempdir().unwrap();
    let config = plan(dir.path());

    let check = check_pipeline(&config, &registry()).unwrap();
    assert!(check.is_ok(), "{check:?}");
    let order: Vec<_> = check.order.iter().map(|s| s.as_str()).collect();
    assert_eq!(order, vec!["load_orders", "orders", "history", "export_totals"]);

    let check = check_pipeline(&config, &ConnectorRegistry::new()).unwrap();
    assert!(!check.is_ok());
    assert_eq!(check.unresolved_connectors.len(), 2);
}

#[test]
fn check_rejects_invalid_documents() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = plan(dir.path());
    config.steps[1].depends_on.push("ghost".into());

    let err = check_pipeline(&config, &registry()).unwrap_err();
    assert!(err.to_string().contains("unknown step 'ghost'"), "{err}");
}
