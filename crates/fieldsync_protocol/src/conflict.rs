//! Conflict types.
//!
//! A conflict exists when a local unsynced edit and a strictly newer remote
//! edit both touch a record. Conflicts are surfaced to the UI layer and
//! never resolved silently, because silent resolution can destroy user work.

use crate::messages::FieldMap;
use serde::{Deserialize, Serialize};

/// A surfaced merge conflict on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordConflict {
    /// Entity model.
    pub model: String,
    /// Record id.
    pub record_id: i64,
    /// The local (unsynced) field values.
    pub local_fields: FieldMap,
    /// The remote field values, held in the record's shadow.
    pub remote_fields: FieldMap,
    /// Device-clock timestamp of the local edit.
    pub local_updated_at: u64,
    /// Server timestamp of the remote edit.
    pub remote_updated_at: u64,
}

/// How a user chose to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Keep the local edit; it stays queued for the server.
    KeepLocal,
    /// Accept the remote version; the local edit is discarded.
    AcceptRemote,
}
