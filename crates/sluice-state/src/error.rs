//! State store error types.

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that raised it.
    #[error("{context}: {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON (schema snapshots) could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap a raw backend error.
    pub fn backend(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }

    /// Wrap a backend error with the operation that failed.
    pub fn backend_context(context: &'static str, err: rusqlite::Error) -> Self {
        Self::BackendContext {
            context,
            source: err,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let msg = StateError::backend(inner).to_string();
        assert!(msg.contains("sqlite"), "got: {msg}");
    }

    #[test]
    fn backend_context_prefixes_operation() {
        let err = StateError::backend_context("record_step: insert", rusqlite::Error::InvalidQuery);
        assert!(err.to_string().starts_with("record_step: insert"));
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(StateError::LockPoisoned.to_string(), "state store lock poisoned");
    }
}
