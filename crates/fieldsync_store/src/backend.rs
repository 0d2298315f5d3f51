//! Storage backends for the local store.
//!
//! A backend persists the full store snapshot. The store saves a snapshot on
//! every commit, so a write that returns `Ok` is durable.

use crate::error::StoreResult;
use crate::record::Record;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// The persisted shape of a store: schema metadata plus all records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Current schema version (0 for a fresh store).
    pub schema_version: u64,
    /// Versions of migration steps already applied.
    pub applied_versions: BTreeSet<u64>,
    /// All records, across all models.
    pub records: Vec<Record>,
    /// Queued outbox entries, stored opaquely; the outbox owns their shape.
    #[serde(default)]
    pub outbox: Vec<serde_json::Value>,
}

/// Abstraction over snapshot persistence.
pub trait StorageBackend: Send + Sync {
    /// Loads the persisted state, or `None` for a fresh store.
    fn load(&self) -> StoreResult<Option<PersistedState>>;

    /// Durably saves the state. Must be atomic: a failed save leaves the
    /// previous snapshot intact.
    fn save(&self, state: &PersistedState) -> StoreResult<()>;
}

/// In-memory backend for tests and ephemeral stores.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> StoreResult<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

/// File backend storing the snapshot as JSON.
///
/// Saves write to a sibling temp file and rename over the target, so a
/// crash mid-save never corrupts the previous snapshot.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Creates a file backend at the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> StoreResult<Option<PersistedState>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        let bytes = serde_json::to_vec(state)?;
        let temp = self.temp_path();
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
