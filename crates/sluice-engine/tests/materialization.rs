//! Materialization semantics of the four write modes, driven through the
//! orchestrator against a file-backed store.

mod common;

use common::{int, text, Harness, PIPELINE};
use rstest::rstest;
use sluice_engine::config::FailurePolicy;
use sluice_engine::schema::{RemovedColumnPolicy, SchemaEvolutionPolicy};
use sluice_state::StateStore;
use sluice_types::error::ErrorKind;
use sluice_types::metric::StepStatus;
use sluice_types::state::WatermarkKey;
use sluice_types::step::{Mode, Step};

fn seed_source(h: &Harness) {
    h.exec(&[
        "CREATE TABLE src (id INTEGER, name TEXT)",
        "INSERT INTO src VALUES (1, 'a'), (2, 'b')",
    ]);
}

#[tokio::test]
async fn replace_is_idempotent() {
    let h = Harness::new();
    seed_source(&h);
    let step = Step::transform("r", "t", "SELECT id, name FROM src");

    for _ in 0..2 {
        let result = h
            .orchestrator()
            .run(vec![step.clone()], FailurePolicy::FailFast)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.step("r").unwrap().rows_affected(), 2);
    }

    assert_eq!(
        h.rows("SELECT id, name FROM t ORDER BY id"),
        vec![vec![int(1), text("a")], vec![int(2), text("b")]]
    );
    let schema = h.store_schema("t");
    assert_eq!(schema, vec!["id INTEGER".to_string(), "name TEXT".to_string()]);
}

#[tokio::test]
async fn replace_swaps_shape_and_leaves_no_staging_table() {
    let h = Harness::new();
    seed_source(&h);
    h.exec(&["CREATE TABLE t (legacy TEXT)", "INSERT INTO t VALUES ('old')"]);

    let result = h
        .orchestrator()
        .run(
            vec![Step::transform("r", "t", "SELECT id FROM src WHERE id = 2")],
            FailurePolicy::FailFast,
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(h.rows("SELECT * FROM t"), vec![vec![int(2)]]);
    assert!(!h.table_exists("sluice_stage_t"));
}

#[tokio::test]
async fn append_adds_new_columns() {
    let h = Harness::new();
    seed_source(&h);
    h.exec(&["CREATE TABLE t (id INTEGER)", "INSERT INTO t VALUES (0)"]);

    let step = Step::transform("a", "t", "SELECT id, name FROM src").with_mode(Mode::Append);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(
        h.rows("SELECT id, name FROM t ORDER BY id"),
        vec![
            vec![int(0), sluice_types::value::Value::Null],
            vec![int(1), text("a")],
            vec![int(2), text("b")],
        ]
    );
}

#[tokio::test]
async fn append_missing_required_column_is_incompatible() {
    let h = Harness::new();
    seed_source(&h);
    h.exec(&[
        "CREATE TABLE t (id INTEGER, name TEXT, region TEXT NOT NULL)",
        "INSERT INTO t VALUES (9, 'z', 'eu')",
    ]);

    let step = Step::transform("a", "t", "SELECT id, name FROM src").with_mode(Mode::Append);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(!result.success);
    let failure = result.step("a").unwrap().failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::SchemaIncompatible);
    assert!(failure.message.contains("region"), "{}", failure.message);
    assert_eq!(h.count("t"), 1);
}

#[tokio::test]
async fn removed_nullable_column_can_be_ignored() {
    let h = Harness::new();
    seed_source(&h);
    h.exec(&["CREATE TABLE t (id INTEGER, name TEXT, note TEXT)"]);

    let policy = SchemaEvolutionPolicy {
        removed_column: RemovedColumnPolicy::Ignore,
        ..SchemaEvolutionPolicy::default()
    };
    let step = Step::transform("a", "t", "SELECT id, name FROM src").with_mode(Mode::Append);
    let result = h
        .orchestrator()
        .with_schema_policy(policy)
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(h.count("t"), 2);
}

#[tokio::test]
async fn merge_upserts_by_key() {
    let h = Harness::new();
    h.exec(&[
        "CREATE TABLE t (id INTEGER, v TEXT)",
        "INSERT INTO t VALUES (1, 'a'), (2, 'b')",
        "CREATE TABLE changes (id INTEGER, v TEXT)",
        "INSERT INTO changes VALUES (2, 'B'), (3, 'c')",
    ]);

    let step = Step::transform("m", "t", "SELECT id, v FROM changes")
        .with_mode(Mode::Merge)
        .with_merge_keys(["id"]);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.step("m").unwrap().rows_affected(), 2);
    assert_eq!(
        h.rows("SELECT id, v FROM t ORDER BY id"),
        vec![
            vec![int(1), text("a")],
            vec![int(2), text("B")],
            vec![int(3), text("c")],
        ]
    );
}

#[tokio::test]
async fn merge_duplicate_source_keys_keep_last_row() {
    let h = Harness::new();
    h.exec(&[
        "CREATE TABLE changes (id INTEGER, v TEXT)",
        "INSERT INTO changes VALUES (1, 'first'), (1, 'second')",
    ]);

    let step = Step::transform("m", "t", "SELECT id, v FROM changes")
        .with_mode(Mode::Merge)
        .with_merge_keys(["id"]);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(h.rows("SELECT id, v FROM t"), vec![vec![int(1), text("second")]]);
}

#[tokio::test]
async fn merge_key_missing_from_result_is_validation_error() {
    let h = Harness::new();
    seed_source(&h);

    let step = Step::transform("m", "t", "SELECT name FROM src")
        .with_mode(Mode::Merge)
        .with_merge_keys(["id"]);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    let failure = result.step("m").unwrap().failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(!h.table_exists("t"));
}

fn seed_days(h: &Harness) {
    h.exec(&[
        "CREATE TABLE events (id INTEGER, day DATE)",
        "INSERT INTO events VALUES \
         (6, '2024-01-06'), (7, '2024-01-07'), (8, '2024-01-08'), (9, '2024-01-09'), \
         (10, '2024-01-10'), (11, '2024-01-11'), (12, '2024-01-12')",
        "CREATE TABLE t (id INTEGER, day DATE)",
        "INSERT INTO t SELECT id, day FROM events WHERE day <= '2024-01-10'",
    ]);
}

#[tokio::test]
async fn incremental_reprocesses_lookback_window() {
    let h = Harness::new();
    seed_days(&h);
    let key = WatermarkKey::new(PIPELINE, "t", "day");
    h.state.put_watermark(&key, "2024-01-10").unwrap();

    let step = Step::transform("i", "t", "SELECT id, day FROM events")
        .with_mode(Mode::Incremental)
        .with_cursor("day", Some("2 days"));

    let result = h
        .orchestrator()
        .run(vec![step.clone()], FailurePolicy::FailFast)
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    // Window [2024-01-08, now]: days 8 through 12.
    assert_eq!(result.step("i").unwrap().rows_affected(), 5);
    assert_eq!(h.count("t"), 7);
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "2024-01-12");

    // Rerun without new data: window [2024-01-10, now], no duplicates, no regression.
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.step("i").unwrap().rows_affected(), 3);
    assert_eq!(h.count("t"), 7);
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "2024-01-12");
}

#[tokio::test]
async fn incremental_adopts_existing_max_as_first_watermark() {
    let h = Harness::new();
    seed_days(&h);
    let key = WatermarkKey::new(PIPELINE, "t", "day");

    let step = Step::transform("i", "t", "SELECT id, day FROM events")
        .with_mode(Mode::Incremental)
        .with_cursor("day", None);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    // Existing max 2024-01-10, no lookback: days 10 through 12.
    assert_eq!(result.step("i").unwrap().rows_affected(), 3);
    assert_eq!(h.count("t"), 7);
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "2024-01-12");
}

#[tokio::test]
async fn failed_incremental_step_keeps_watermark_and_rows() {
    let h = Harness::new();
    h.exec(&[
        "CREATE TABLE t (id INTEGER NOT NULL, day DATE)",
        "INSERT INTO t VALUES (1, '2024-01-10')",
        "CREATE TABLE late (id INTEGER, day DATE)",
        "INSERT INTO late VALUES (NULL, '2024-01-12')",
    ]);
    let key = WatermarkKey::new(PIPELINE, "t", "day");
    h.state.put_watermark(&key, "2024-01-10").unwrap();

    let step = Step::transform("i", "t", "SELECT id, day FROM late")
        .with_mode(Mode::Incremental)
        .with_cursor("day", None);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.step("i").unwrap().failure().unwrap().kind,
        ErrorKind::Execution
    );
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "2024-01-10");
    assert_eq!(h.rows("SELECT id FROM t"), vec![vec![int(1)]]);
}

#[tokio::test]
async fn incremental_integer_cursor_with_unit_lookback() {
    let h = Harness::new();
    h.exec(&[
        "CREATE TABLE seq (n INTEGER, v TEXT)",
        "INSERT INTO seq VALUES (1, 'a'), (2, 'b'), (3, 'c'), (4, 'd')",
    ]);
    let key = WatermarkKey::new(PIPELINE, "t", "n");
    h.state.put_watermark(&key, "3").unwrap();

    let step = Step::transform("i", "t", "SELECT n, v FROM seq")
        .with_mode(Mode::Incremental)
        .with_cursor("n", Some("1"));
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    // Window [2, unbounded] against an absent table.
    assert_eq!(h.rows("SELECT n FROM t ORDER BY n"), vec![vec![int(2)], vec![int(3)], vec![int(4)]]);
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "4");
}

#[tokio::test]
async fn incremental_text_dates_accept_day_lookback() {
    let h = Harness::new();
    h.exec(&[
        "CREATE TABLE events (id INTEGER, day TEXT)",
        "INSERT INTO events VALUES \
         (6, '2024-01-06'), (7, '2024-01-07'), (8, '2024-01-08'), (9, '2024-01-09'), \
         (10, '2024-01-10'), (11, '2024-01-11'), (12, '2024-01-12')",
        "CREATE TABLE t (id INTEGER, day TEXT)",
        "INSERT INTO t SELECT id, day FROM events WHERE day <= '2024-01-10'",
    ]);
    let key = WatermarkKey::new(PIPELINE, "t", "day");
    h.state.put_watermark(&key, "2024-01-10").unwrap();

    let step = Step::transform("i", "t", "SELECT id, day FROM events")
        .with_mode(Mode::Incremental)
        .with_cursor("day", Some("2 days"));
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.step("i").unwrap().rows_affected(), 5);
    assert_eq!(h.count("t"), 7);
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "2024-01-12");
}

#[tokio::test]
async fn incremental_real_cursor_advances_numerically() {
    let h = Harness::new();
    h.exec(&["CREATE TABLE readings (v REAL)", "INSERT INTO readings VALUES (9.5)"]);
    let key = WatermarkKey::new(PIPELINE, "t", "v");
    let step = Step::transform("i", "t", "SELECT v FROM readings")
        .with_mode(Mode::Incremental)
        .with_cursor("v", None);

    let result = h
        .orchestrator()
        .run(vec![step.clone()], FailurePolicy::FailFast)
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "9.5");

    h.exec(&["INSERT INTO readings VALUES (10.5)"]);
    let result = h
        .orchestrator()
        .run(vec![step], FailurePolicy::FailFast)
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(h.state.get_watermark(&key).unwrap().unwrap().value, "10.5");
    assert_eq!(h.count("t"), 2);
}

/// Every mode applied twice to the same two-row input.
#[rstest]
#[case::replace(Mode::Replace, 2)]
#[case::append(Mode::Append, 4)]
#[case::merge(Mode::Merge, 2)]
#[case::incremental(Mode::Incremental, 2)]
#[tokio::test]
async fn rerun_row_counts_per_mode(#[case] mode: Mode, #[case] expected: i64) {
    let h = Harness::new();
    seed_source(&h);

    let mut step = Step::transform("s", "t", "SELECT id, name FROM src").with_mode(mode);
    match mode {
        Mode::Merge => step = step.with_merge_keys(["id"]),
        Mode::Incremental => step = step.with_cursor("id", None),
        Mode::Replace | Mode::Append => {}
    }

    for _ in 0..2 {
        let result = h
            .orchestrator()
            .run(vec![step.clone()], FailurePolicy::FailFast)
            .await
            .unwrap();
        assert!(result.success, "{mode}: {result:?}");
    }
    assert_eq!(h.count("t"), expected, "{mode}");
    assert_eq!(h.metrics.snapshot().len(), 2);
    assert!(h
        .metrics
        .snapshot()
        .iter()
        .all(|m| m.status == StepStatus::Succeeded));
}
