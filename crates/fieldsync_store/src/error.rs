//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error from the storage backend.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization or deserialization failed.
    #[error("snapshot codec error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A schema migration step failed.
    ///
    /// This is fatal: the store must not be used until the migration
    /// succeeds, since the schema may otherwise be inconsistent with
    /// what the application expects.
    #[error("migration {version} failed: {message}")]
    MigrationFailed {
        /// Version of the step that failed.
        version: u64,
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StoreError {
    /// Creates a migration failed error.
    pub fn migration_failed(version: u64, message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            version,
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error is fatal for the store as a whole.
    ///
    /// Migration failures block startup entirely; I/O and codec errors are
    /// fatal for the affected operation but the store may still serve reads.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::MigrationFailed { .. })
    }
}
