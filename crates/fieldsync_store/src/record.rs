//! Record types for the local store.
//!
//! A [`Record`] is one domain entity (a contact, an order, a message).
//! Records created offline carry a negative placeholder id until the server
//! assigns a real one; the outbox rewrites the placeholder on acknowledgment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field map for a record. Values are opaque JSON.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Synchronization state of a record relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// In sync with the server.
    Clean,
    /// Local edit exists that the server has not seen.
    Dirty,
    /// Created locally; the server does not know the id yet.
    PendingCreate,
    /// Updated locally; transmission queued.
    PendingUpdate,
    /// Deleted locally; transmission queued.
    PendingDelete,
    /// A local unsynced edit and a newer remote edit both exist.
    Conflict,
}

impl SyncState {
    /// Returns true if an unsynced local edit exists.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncState::Dirty
                | SyncState::PendingCreate
                | SyncState::PendingUpdate
                | SyncState::PendingDelete
        )
    }

    /// Returns true if the record is in sync with the server.
    pub fn is_clean(&self) -> bool {
        matches!(self, SyncState::Clean)
    }
}

/// A domain entity held in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned id once known; negative while a local placeholder.
    pub id: i64,
    /// Entity type tag (one logical table per model).
    pub model: String,
    /// Field name to value.
    pub fields: FieldMap,
    /// Server-authoritative timestamp in Unix millis, when known.
    pub updated_at: Option<u64>,
    /// Device-clock timestamp of the last local write, Unix millis.
    pub local_updated_at: u64,
    /// Sync state relative to the server.
    pub sync_state: SyncState,
    /// Remote version preserved alongside a conflicted local edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<FieldMap>,
}

impl Record {
    /// Creates a clean record.
    pub fn new(model: impl Into<String>, id: i64) -> Self {
        Self {
            id,
            model: model.into(),
            fields: FieldMap::new(),
            updated_at: None,
            local_updated_at: unix_millis(),
            sync_state: SyncState::Clean,
            shadow: None,
        }
    }

    /// Sets a field value (builder style).
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Sets the sync state (builder style).
    pub fn with_sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = state;
        self
    }

    /// Sets the server timestamp (builder style).
    pub fn with_updated_at(mut self, updated_at: u64) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Returns true if the id is a locally generated placeholder.
    pub fn has_placeholder_id(&self) -> bool {
        self.id < 0
    }

    /// Returns a field value, if present.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Current device clock as Unix milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
