//! Shared Sluice plan, schema, cursor, and error model types.
//!
//! This crate carries no storage or runtime dependencies so the state,
//! engine, and connector crates can all share it.

pub mod connector;
pub mod cursor;
pub mod error;
pub mod metric;
pub mod schema;
pub mod state;
pub mod step;
pub mod value;
