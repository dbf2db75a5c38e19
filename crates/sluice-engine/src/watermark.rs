//! Watermark manager.
//!
//! Reads go cache, then state store, then a `MAX(cursor)` scan of the
//! target table (persisted as the initial watermark). Advances write
//! through to the state store and never move a watermark backwards.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use sluice_state::StateStore;
use sluice_types::cursor::{CursorKind, CursorValue};
use sluice_types::state::WatermarkKey;
use sluice_types::value::{Params, Value};

use crate::errors::EngineError;
use crate::store::{quote_ident, TableSession};

#[derive(Debug, Default)]
struct Slot {
    loaded: bool,
    value: Option<String>,
}

/// Per-key cached watermarks backed by a [`StateStore`].
pub struct WatermarkManager {
    state: Arc<dyn StateStore>,
    slots: DashMap<WatermarkKey, Arc<Mutex<Slot>>>,
}

fn parse_cursor(kind: Option<CursorKind>, raw: &str) -> Result<CursorValue, EngineError> {
    match kind {
        Some(kind) => CursorValue::parse(kind, raw)
            .map_err(|e| EngineError::Infrastructure(anyhow::anyhow!("stored watermark: {e}"))),
        None => Ok(CursorValue::infer(raw)),
    }
}

/// SQL that reads the largest cursor value of `table`.
///
/// Temporal cursors are ordered by `julianday` so mixed ISO-8601 layouts
/// compare correctly.
pub(crate) fn max_cursor_sql(table: &str, column: &str, kind: Option<CursorKind>) -> String {
    let col = quote_ident(column);
    let from = if table.starts_with("temp.") {
        format!("temp.{}", quote_ident(&table["temp.".len()..]))
    } else {
        quote_ident(table)
    };
    if kind.is_some_and(CursorKind::is_temporal) {
        format!("SELECT {col} FROM {from} WHERE {col} IS NOT NULL ORDER BY julianday({col}) DESC LIMIT 1")
    } else {
        format!("SELECT MAX({col}) FROM {from}")
    }
}

impl WatermarkManager {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &WatermarkKey) -> Arc<Mutex<Slot>> {
        self.slots.entry(key.clone()).or_default().clone()
    }

    fn lock(slot: &Mutex<Slot>) -> Result<MutexGuard<'_, Slot>, EngineError> {
        slot.lock()
            .map_err(|_| EngineError::Infrastructure(anyhow::anyhow!("watermark slot poisoned")))
    }

    /// Current watermark for `key`.
    ///
    /// When neither cache nor state store has one and `table_exists`, the
    /// largest cursor value already in the target is adopted and persisted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] on state or store failures.
    pub fn get(
        &self,
        key: &WatermarkKey,
        kind: Option<CursorKind>,
        session: &dyn TableSession,
        table_exists: bool,
    ) -> Result<Option<CursorValue>, EngineError> {
        let slot = self.slot(key);
        let mut guard = Self::lock(&slot)?;

        if !guard.loaded {
            let mut value = self.state.get_watermark(key)?.map(|w| w.value);
            if value.is_none() && table_exists {
                let sql = max_cursor_sql(&key.table, &key.cursor_column, kind);
                if let Some(max) = session.query_scalar(&sql, &Params::new())? {
                    let cursor = match max {
                        Value::Integer(v) => CursorValue::Integer(v),
                        Value::Real(v) => CursorValue::Real(v),
                        other => parse_cursor(kind, &other.to_text())?,
                    };
                    let rendered = cursor.render();
                    if self.state.compare_and_set_watermark(key, None, &rendered)? {
                        tracing::info!(
                            watermark = %key,
                            value = %rendered,
                            "Initialized watermark from existing table"
                        );
                        value = Some(rendered);
                    } else {
                        value = self.state.get_watermark(key)?.map(|w| w.value);
                    }
                }
            }
            guard.value = value;
            guard.loaded = true;
        }

        guard
            .value
            .as_deref()
            .map(|raw| parse_cursor(kind, raw))
            .transpose()
    }

    /// Advance `key` to `value` unless that would move it backwards.
    ///
    /// Returns whether the stored watermark changed. Call only after the
    /// step transaction has committed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] on state store failures.
    pub fn advance(&self, key: &WatermarkKey, value: &CursorValue) -> Result<bool, EngineError> {
        const MAX_ATTEMPTS: usize = 3;

        let slot = self.slot(key);
        let mut guard = Self::lock(&slot)?;
        let rendered = value.render();

        for _ in 0..MAX_ATTEMPTS {
            let current = self.state.get_watermark(key)?.map(|w| w.value);
            if let Some(raw) = current.as_deref() {
                let existing = parse_cursor(Some(value.kind()), raw)
                    .unwrap_or_else(|_| CursorValue::infer(raw));
                if existing >= *value {
                    tracing::debug!(
                        watermark = %key,
                        current = raw,
                        candidate = %rendered,
                        "Skipping watermark regression"
                    );
                    guard.value = current;
                    guard.loaded = true;
                    return Ok(false);
                }
            }
            if self
                .state
                .compare_and_set_watermark(key, current.as_deref(), &rendered)?
            {
                tracing::info!(watermark = %key, value = %rendered, "Advanced watermark");
                guard.value = Some(rendered);
                guard.loaded = true;
                return Ok(true);
            }
        }

        Err(EngineError::Infrastructure(anyhow::anyhow!(
            "watermark {key} changed concurrently {MAX_ATTEMPTS} times"
        )))
    }
}
