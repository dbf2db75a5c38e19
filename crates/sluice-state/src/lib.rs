//! Pipeline state persistence for the Sluice engine.
//!
//! Provides the [`StateStore`] trait and a [`SqliteStateStore`]
//! implementation for watermarks, schema snapshots, and run history.

#![warn(clippy::pedantic)]

pub mod error;
pub mod sqlite;
pub mod store;

pub use error::StateError;
pub use sqlite::SqliteStateStore;
pub use store::StateStore;

/// Convenience re-exports for state consumers.
pub mod prelude {
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateStore;
    pub use crate::store::StateStore;
    pub use sluice_types::state::{
        PipelineId, RunRecord, RunStats, RunStatus, StepRunRecord, Watermark, WatermarkKey,
    };
}
