//! Bundled connectors for Sluice load and export steps.

pub mod csv;

pub use crate::csv::{CsvSink, CsvSource};

/// Reference scheme the CSV connectors are registered under.
pub const CSV_SCHEME: &str = "csv";
