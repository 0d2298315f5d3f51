//! The local store: persisted source of truth for offline reads.
//!
//! All mutations are serialized through a single write lock and committed to
//! the storage backend before change events are emitted. Readers observe
//! either the pre- or post-write snapshot of a record, never a partial
//! field merge.

use crate::backend::{PersistedState, StorageBackend};
use crate::change_feed::{ChangeFeed, ChangeKind, RecordChange};
use crate::error::{StoreError, StoreResult};
use crate::record::{unix_millis, Record};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::Receiver;
use tracing::debug;

type Tables = BTreeMap<String, BTreeMap<i64, Record>>;

struct StoreInner {
    schema_version: u64,
    applied_versions: BTreeSet<u64>,
    tables: Tables,
    outbox: Vec<serde_json::Value>,
}

impl StoreInner {
    fn from_persisted(state: PersistedState) -> Self {
        let mut tables: Tables = BTreeMap::new();
        for record in state.records {
            tables
                .entry(record.model.clone())
                .or_default()
                .insert(record.id, record);
        }
        Self {
            schema_version: state.schema_version,
            applied_versions: state.applied_versions,
            tables,
            outbox: state.outbox,
        }
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            schema_version: self.schema_version,
            applied_versions: self.applied_versions.clone(),
            records: self
                .tables
                .values()
                .flat_map(|table| table.values().cloned())
                .collect(),
            outbox: self.outbox.clone(),
        }
    }
}

/// Mutable view of store tables handed to a migration step.
///
/// Changes made through the transaction become visible and durable only if
/// the whole step succeeds; on failure nothing is kept.
pub struct MigrationTxn<'a> {
    tables: &'a mut Tables,
}

impl MigrationTxn<'_> {
    /// Returns the model names that currently have records.
    pub fn models(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Returns all records of a model, in id order.
    pub fn records(&self, model: &str) -> Vec<Record> {
        self.tables
            .get(model)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts or replaces a record.
    pub fn put(&mut self, record: Record) {
        self.tables
            .entry(record.model.clone())
            .or_default()
            .insert(record.id, record);
    }

    /// Removes a record.
    pub fn remove(&mut self, model: &str, id: i64) {
        if let Some(table) = self.tables.get_mut(model) {
            table.remove(&id);
        }
    }

    /// Renames a field on every record of a model, preserving values.
    pub fn rename_field(&mut self, model: &str, from: &str, to: &str) {
        if let Some(table) = self.tables.get_mut(model) {
            for record in table.values_mut() {
                if let Some(value) = record.fields.remove(from) {
                    record.fields.insert(to.to_string(), value);
                }
            }
        }
    }

    /// Sets a field on every record of a model that does not already have it.
    pub fn add_field_default(&mut self, model: &str, name: &str, value: serde_json::Value) {
        if let Some(table) = self.tables.get_mut(model) {
            for record in table.values_mut() {
                record
                    .fields
                    .entry(name.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// The persisted local store.
///
/// Owns all record storage. Server-originated changes are applied by the
/// sync coordinator; UI-originated writes go through the outbox enqueue
/// path. Both end up here, serialized by a single write lock.
pub struct LocalStore {
    inner: RwLock<StoreInner>,
    backend: Box<dyn StorageBackend>,
    feed: ChangeFeed,
}

impl LocalStore {
    /// Opens a store over the given backend, loading any persisted snapshot.
    pub fn open(backend: Box<dyn StorageBackend>) -> StoreResult<Self> {
        let state = backend.load()?.unwrap_or_default();
        Ok(Self {
            inner: RwLock::new(StoreInner::from_persisted(state)),
            backend,
            feed: ChangeFeed::new(),
        })
    }

    /// Opens an ephemeral in-memory store.
    pub fn in_memory() -> StoreResult<Self> {
        Self::open(Box::new(crate::backend::MemoryBackend::new()))
    }

    /// Returns the current schema version.
    pub fn schema_version(&self) -> u64 {
        self.inner.read().schema_version
    }

    /// Returns true if the given migration version has been applied.
    pub fn is_applied(&self, version: u64) -> bool {
        self.inner.read().applied_versions.contains(&version)
    }

    /// Fetches a record by model and id.
    pub fn get(&self, model: &str, id: i64) -> Option<Record> {
        self.inner
            .read()
            .tables
            .get(model)
            .and_then(|t| t.get(&id))
            .cloned()
    }

    /// Returns a point-in-time snapshot of records matching the filter.
    ///
    /// Ordered by the named sort field (records without the field sort
    /// first), ties broken by id. The result is not a live view.
    pub fn query<F>(&self, model: &str, filter: F, sort_key: &str) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        let inner = self.inner.read();
        let mut results: Vec<Record> = inner
            .tables
            .get(model)
            .map(|t| t.values().filter(|r| filter(r)).cloned().collect())
            .unwrap_or_default();

        results.sort_by(|a, b| {
            value_cmp(a.field(sort_key), b.field(sort_key)).then(a.id.cmp(&b.id))
        });
        results
    }

    /// Returns the number of records for a model.
    pub fn record_count(&self, model: &str) -> usize {
        self.inner
            .read()
            .tables
            .get(model)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    /// Inserts a record or merges it onto the existing row.
    ///
    /// Partial updates are field-level merges: fields absent from `record`
    /// are preserved from the stored row. Metadata (`updated_at`,
    /// `local_updated_at`, `sync_state`, `shadow`) is taken from `record`.
    /// Conflict resolution happens upstream; at this layer the incoming
    /// record always wins.
    pub fn upsert(&self, record: Record) -> StoreResult<()> {
        let change = {
            let mut inner = self.inner.write();
            let table = inner.tables.entry(record.model.clone()).or_default();

            let (merged, kind, previous) = match table.get(&record.id) {
                Some(existing) => {
                    let mut merged = record.clone();
                    for (name, value) in &existing.fields {
                        merged
                            .fields
                            .entry(name.clone())
                            .or_insert_with(|| value.clone());
                    }
                    (merged, ChangeKind::Updated, Some(existing.clone()))
                }
                None => (record.clone(), ChangeKind::Added, None),
            };

            table.insert(merged.id, merged.clone());
            if let Err(e) = self.backend.save(&inner.to_persisted()) {
                // Roll the row back so the in-memory view matches disk.
                let table = inner.tables.entry(merged.model.clone()).or_default();
                match previous {
                    Some(prev) => {
                        table.insert(prev.id, prev);
                    }
                    None => {
                        table.remove(&merged.id);
                    }
                }
                return Err(e);
            }

            RecordChange {
                kind,
                record: merged,
            }
        };

        self.feed.emit(change);
        Ok(())
    }

    /// Deletes a record, returning the removed row if it existed.
    pub fn delete(&self, model: &str, id: i64) -> StoreResult<Option<Record>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.tables.get_mut(model).and_then(|t| t.remove(&id));
            if let Some(record) = &removed {
                if let Err(e) = self.backend.save(&inner.to_persisted()) {
                    inner
                        .tables
                        .entry(model.to_string())
                        .or_default()
                        .insert(id, record.clone());
                    return Err(e);
                }
            }
            removed
        };

        if let Some(record) = &removed {
            self.feed.emit(RecordChange {
                kind: ChangeKind::Removed,
                record: record.clone(),
            });
        }
        Ok(removed)
    }

    /// Rewrites a placeholder id to its server-assigned id.
    ///
    /// Moves the row to the new id and rewrites any `<model>_id` field in
    /// other tables that still references the placeholder. After this call
    /// no record carries the placeholder id.
    pub fn remap_id(&self, model: &str, placeholder: i64, server_id: i64) -> StoreResult<()> {
        let changes = {
            let mut inner = self.inner.write();
            let snapshot = inner.to_persisted();

            let Some(mut record) = inner
                .tables
                .get_mut(model)
                .and_then(|t| t.remove(&placeholder))
            else {
                return Err(StoreError::invalid_operation(format!(
                    "no {model} record with id {placeholder} to remap"
                )));
            };
            record.id = server_id;
            inner
                .tables
                .entry(model.to_string())
                .or_default()
                .insert(server_id, record.clone());

            let mut changes = vec![RecordChange {
                kind: ChangeKind::Updated,
                record,
            }];

            let reference_field = format!("{model}_id");
            for (table_model, table) in inner.tables.iter_mut() {
                if table_model.as_str() == model {
                    continue;
                }
                for row in table.values_mut() {
                    let matches = row
                        .field(&reference_field)
                        .and_then(|v| v.as_i64())
                        .is_some_and(|v| v == placeholder);
                    if matches {
                        row.fields
                            .insert(reference_field.clone(), serde_json::json!(server_id));
                        changes.push(RecordChange {
                            kind: ChangeKind::Updated,
                            record: row.clone(),
                        });
                    }
                }
            }

            if let Err(e) = self.backend.save(&inner.to_persisted()) {
                *inner = StoreInner::from_persisted(snapshot);
                return Err(e);
            }
            changes
        };

        debug!(model, placeholder, server_id, "remapped placeholder id");
        for change in changes {
            self.feed.emit(change);
        }
        Ok(())
    }

    /// Replaces the persisted outbox rows.
    ///
    /// The rows are opaque to the store; the outbox serializes its queue
    /// through this so queued mutations survive a restart alongside the
    /// records they touch.
    pub fn set_outbox(&self, rows: Vec<serde_json::Value>) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let previous = std::mem::replace(&mut inner.outbox, rows);
        if let Err(e) = self.backend.save(&inner.to_persisted()) {
            inner.outbox = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Returns the persisted outbox rows.
    pub fn outbox_rows(&self) -> Vec<serde_json::Value> {
        self.inner.read().outbox.clone()
    }

    /// Subscribes to committed changes for a model.
    pub fn subscribe(&self, model: &str) -> Receiver<RecordChange> {
        self.feed.subscribe(model)
    }

    /// Runs one migration step atomically.
    ///
    /// The step mutates a working copy of the tables; the new data, the
    /// bumped schema version, and the applied-version entry are committed in
    /// a single backend save. On step failure or save failure nothing
    /// changes and a fatal `MigrationFailed` is returned.
    pub(crate) fn run_migration<F>(&self, version: u64, name: &str, step: F) -> StoreResult<()>
    where
        F: FnOnce(&mut MigrationTxn<'_>) -> StoreResult<()>,
    {
        let mut inner = self.inner.write();
        let mut working = inner.tables.clone();

        let mut txn = MigrationTxn {
            tables: &mut working,
        };
        step(&mut txn).map_err(|e| StoreError::migration_failed(version, e.to_string()))?;

        let candidate = StoreInner {
            schema_version: inner.schema_version.max(version),
            applied_versions: {
                let mut applied = inner.applied_versions.clone();
                applied.insert(version);
                applied
            },
            tables: working,
            outbox: inner.outbox.clone(),
        };
        self.backend
            .save(&candidate.to_persisted())
            .map_err(|e| StoreError::migration_failed(version, e.to_string()))?;

        *inner = candidate;
        debug!(version, name, "applied migration step");
        Ok(())
    }
}

/// Orders JSON values for query sorting.
///
/// Missing values sort first, then by type (null, bool, number, string,
/// everything else by serialized form).
fn value_cmp(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    fn type_rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ if type_rank(a) != type_rank(b) => type_rank(a).cmp(&type_rank(b)),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}
