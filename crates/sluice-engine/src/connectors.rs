//! Connector registry.
//!
//! Load and export steps name their connector with a `scheme:location`
//! reference. The registry resolves the scheme to a shared implementation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sluice_types::connector::{split_reference, Sink, Source};

/// Scheme-keyed sources and sinks.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
    sinks: HashMap<String, Arc<dyn Sink>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, scheme: impl Into<String>, source: Arc<dyn Source>) {
        self.sources.insert(scheme.into().to_ascii_lowercase(), source);
    }

    pub fn register_sink(&mut self, scheme: impl Into<String>, sink: Arc<dyn Sink>) {
        self.sinks.insert(scheme.into().to_ascii_lowercase(), sink);
    }

    /// Resolve a source reference to its connector and location.
    ///
    /// # Errors
    ///
    /// Fails when no source is registered for the scheme.
    pub fn source<'r>(&self, reference: &'r str) -> Result<(Arc<dyn Source>, &'r str)> {
        let (scheme, location) = split_reference(reference);
        self.sources
            .get(&scheme.to_ascii_lowercase())
            .map(|s| (Arc::clone(s), location))
            .ok_or_else(|| anyhow!("no source connector registered for scheme '{scheme}' ({reference})"))
    }

    /// Resolve a sink reference to its connector and location.
    ///
    /// # Errors
    ///
    /// Fails when no sink is registered for the scheme.
    pub fn sink<'r>(&self, reference: &'r str) -> Result<(Arc<dyn Sink>, &'r str)> {
        let (scheme, location) = split_reference(reference);
        self.sinks
            .get(&scheme.to_ascii_lowercase())
            .map(|s| (Arc::clone(s), location))
            .ok_or_else(|| anyhow!("no sink connector registered for scheme '{scheme}' ({reference})"))
    }

    #[must_use]
    pub fn has_source(&self, reference: &str) -> bool {
        self.source(reference).is_ok()
    }

    #[must_use]
    pub fn has_sink(&self, reference: &str) -> bool {
        self.sink(reference).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::value::Batch;

    struct Empty;

    impl Source for Empty {
        fn read(&self, _location: &str) -> Result<Batch> {
            Ok(Batch::default())
        }
    }

    #[test]
    fn resolves_by_scheme() {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("CSV", Arc::new(Empty));
        let (_, location) = registry.source("csv:data/in.csv").unwrap();
        assert_eq!(location, "data/in.csv");
        assert!(registry.has_source("csv:x"));
        assert!(!registry.has_sink("csv:x"));
    }

    #[test]
    fn unknown_scheme_names_reference() {
        let registry = ConnectorRegistry::new();
        let err = registry.source("s3:bucket/key").err().unwrap();
        assert!(err.to_string().contains("s3"));
    }
}
