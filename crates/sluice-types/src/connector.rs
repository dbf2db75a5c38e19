//! Connector contracts for load and export steps.
//!
//! Connectors resolve the `location` half of a `scheme:location` reference.
//! They run on the blocking pool and must be shareable across steps.

use crate::value::Batch;

/// Reads a full batch from an external location.
pub trait Source: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the location cannot be read or decoded.
    fn read(&self, location: &str) -> anyhow::Result<Batch>;
}

/// Writes a batch to an external location, returning the rows written.
pub trait Sink: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the location cannot be written.
    fn write(&self, location: &str, batch: &Batch) -> anyhow::Result<u64>;
}

/// Split a connector reference into `(scheme, location)`.
///
/// References without a scheme are treated as `file` paths.
#[must_use]
pub fn split_reference(reference: &str) -> (&str, &str) {
    match reference.split_once(':') {
        Some((scheme, location))
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            (scheme, location)
        }
        _ => ("file", reference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_extracts_scheme() {
        assert_eq!(split_reference("csv:data/orders.csv"), ("csv", "data/orders.csv"));
        assert_eq!(split_reference("orders.csv"), ("file", "orders.csv"));
        assert_eq!(split_reference("./a:b.csv"), ("file", "./a:b.csv"));
    }

    #[test]
    fn traits_are_object_safe() {
        fn _source(_: &dyn Source) {}
        fn _sink(_: &dyn Sink) {}
    }
}
