//! Error types for the sync engine.
//!
//! Network and protocol errors are recovered locally via retry/backoff and
//! reach callers only as state transitions or, past a retry ceiling, as
//! surfaced failures. Data-integrity ambiguities (conflicts) are never
//! auto-resolved.

use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The bus connection dropped or could not be established.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// What happened.
        reason: String,
    },

    /// The server rejected the channel subscription.
    #[error("subscription rejected: {reason}")]
    SubscriptionRejected {
        /// Server-provided reason.
        reason: String,
    },

    /// A local unsynced edit collides with a newer remote edit.
    #[error("merge conflict on {model} record {record_id}")]
    MergeConflict {
        /// Entity model.
        model: String,
        /// Record id.
        record_id: i64,
    },

    /// The server rejected an outbox entry.
    #[error("outbox entry {request_id} rejected: {reason}")]
    OutboxRejected {
        /// Idempotency key of the entry.
        request_id: Uuid,
        /// Server-provided reason.
        reason: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },

    /// An outbox entry exhausted its retry ceiling and awaits manual action.
    #[error("outbox entry {request_id} failed permanently")]
    OutboxFailed {
        /// Idempotency key of the entry.
        request_id: Uuid,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] fieldsync_store::StoreError),

    /// A frame or payload failed typed decoding.
    #[error(transparent)]
    Decode(#[from] fieldsync_protocol::DecodeError),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The engine has been shut down.
    #[error("engine is closed")]
    Closed,
}

impl SyncError {
    /// Creates a connection lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Creates a subscription rejected error.
    pub fn subscription_rejected(reason: impl Into<String>) -> Self {
        Self::SubscriptionRejected {
            reason: reason.into(),
        }
    }

    /// Creates a retryable outbox rejection.
    pub fn outbox_rejected(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self::OutboxRejected {
            request_id,
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable outbox rejection.
    pub fn outbox_rejected_fatal(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self::OutboxRejected {
            request_id,
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionLost { .. } => true,
            SyncError::SubscriptionRejected { .. } => true,
            SyncError::Timeout => true,
            SyncError::OutboxRejected { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
