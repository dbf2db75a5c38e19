//! Run-scoped table leases.
//!
//! A target may be written by several steps in one run only when those
//! writes are ordered by the plan. Conflicts are reported, never retried.

use std::collections::HashMap;
use std::sync::Mutex;

use sluice_types::step::StepId;

use crate::errors::EngineError;

/// In-memory claim of a target by one step.
#[derive(Debug, PartialEq, Eq)]
pub struct TableLease {
    target: String,
    holder: StepId,
}

impl TableLease {
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn holder(&self) -> &StepId {
        &self.holder
    }
}

#[derive(Debug, Default)]
struct LeaseRecord {
    holder: Option<StepId>,
    writers: Vec<StepId>,
}

/// Lease table for one run.
#[derive(Debug, Default)]
pub struct LockManager {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

fn normalize(target: &str) -> String {
    target.to_ascii_lowercase()
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for `step`.
    ///
    /// `is_ancestor(w)` must report whether `w` is a transitive dependency of
    /// `step`; earlier writers that are not conflict with it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Concurrency`] when the target is held or was
    /// written by an unordered step.
    pub fn acquire(
        &self,
        target: &str,
        step: &StepId,
        is_ancestor: impl Fn(&StepId) -> bool,
    ) -> Result<TableLease, EngineError> {
        let key = normalize(target);
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| EngineError::Infrastructure(anyhow::anyhow!("lease table poisoned")))?;
        let record = leases.entry(key.clone()).or_default();

        if let Some(holder) = &record.holder {
            return Err(EngineError::Concurrency {
                target: key.clone(),
                message: format!("held by step '{holder}' while step '{step}' tried to write it"),
            });
        }
        if let Some(other) = record.writers.iter().find(|w| *w != step && !is_ancestor(w)) {
            return Err(EngineError::Concurrency {
                target: key.clone(),
                message: format!(
                    "already written by step '{other}' in this run, which step '{step}' does not depend on"
                ),
            });
        }

        record.holder = Some(step.clone());
        record.writers.push(step.clone());
        tracing::debug!(table = %key, step = %step, "Acquired table lease");
        Ok(TableLease {
            target: key,
            holder: step.clone(),
        })
    }

    /// Release a lease. Releasing a lease that is no longer held is a no-op.
    pub fn release(&self, lease: TableLease) {
        let Ok(mut leases) = self.leases.lock() else {
            return;
        };
        if let Some(record) = leases.get_mut(&lease.target) {
            if record.holder.as_ref() == Some(&lease.holder) {
                record.holder = None;
            }
        }
    }

    /// Whether any step currently holds `target`.
    #[must_use]
    pub fn is_held(&self, target: &str) -> bool {
        self.leases
            .lock()
            .map(|l| l.get(&normalize(target)).is_some_and(|r| r.holder.is_some()))
            .unwrap_or(false)
    }
}
