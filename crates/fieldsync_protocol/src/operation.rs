//! Outbox operation types.
//!
//! An [`OutboxEntry`] is a durable local mutation awaiting transmission.
//! Entries carry a client-generated request id so retransmissions after a
//! dropped connection are idempotent server-side.

use crate::messages::FieldMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Record created locally; server id unknown.
    Create,
    /// Record updated locally.
    Update,
    /// Record deleted locally.
    Delete,
}

/// Outcome of coalescing a later mutation into a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// The later mutation was folded into this entry.
    Merged,
    /// Create followed by delete: the record never reached the server, so
    /// both operations cancel and the entry should be dropped.
    Cancelled,
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Client-generated idempotency key, stable across retries.
    pub request_id: Uuid,
    /// Entity model.
    pub model: String,
    /// Record id (may be a negative placeholder for creates).
    pub record_id: i64,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Snapshot of the mutated fields.
    pub payload: FieldMap,
    /// Transmission attempts so far.
    pub attempts: u32,
    /// Creation time, Unix millis.
    pub created_at: u64,
}

impl OutboxEntry {
    /// Creates a new entry with a fresh request id.
    pub fn new(
        model: impl Into<String>,
        record_id: i64,
        kind: OperationKind,
        payload: FieldMap,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            model: model.into(),
            record_id,
            kind,
            payload,
            attempts: 0,
            created_at: now_millis(),
        }
    }

    /// Folds a later mutation for the same record into this queued entry.
    ///
    /// Only valid for entries that are not in flight; the outbox enforces
    /// that. The coalesced payload reflects both edits, later fields
    /// winning.
    pub fn coalesce(&mut self, later_kind: OperationKind, later_payload: FieldMap) -> CoalesceOutcome {
        match later_kind {
            OperationKind::Delete => {
                if self.kind == OperationKind::Create {
                    return CoalesceOutcome::Cancelled;
                }
                self.kind = OperationKind::Delete;
                self.payload.clear();
                CoalesceOutcome::Merged
            }
            OperationKind::Update | OperationKind::Create => {
                // A queued create stays a create; its payload absorbs the
                // later edit.
                self.payload.extend(later_payload);
                CoalesceOutcome::Merged
            }
        }
    }

    /// Records a failed transmission attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// Server acknowledgment of a transmitted mutation.
///
/// Carries the canonical record identity: the server-assigned id (relevant
/// for creates) and the authoritative timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAck {
    /// Canonical server id for the record.
    pub server_id: i64,
    /// Server-authoritative timestamp, Unix millis.
    pub updated_at: u64,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
