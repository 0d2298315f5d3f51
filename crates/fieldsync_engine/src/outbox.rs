//! Outbox: durable queue of local mutations awaiting transmission.
//!
//! Every UI-originated write lands in the store immediately (optimistic
//! apply) and queues an [`OutboxEntry`] for the server. Entries for the
//! same record coalesce while queued, so a burst of edits travels as one
//! request. Per-record ordering is strict FIFO; entries for different
//! records are independent.
//!
//! The queue is persisted through the store on every change, so entries
//! (request ids included) survive a restart and retransmissions after a
//! crash still deduplicate server-side.

use crate::config::OutboxConfig;
use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{CoalesceOutcome, FieldMap, MutationAck, OperationKind, OutboxEntry};
use fieldsync_store::{unix_millis, LocalStore, Record, StoreError, SyncState};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivers one outbox entry to the server.
///
/// Implementations are expected to put the entry's `request_id` on the
/// wire so the server can deduplicate retransmissions.
pub trait MutationSender: Send + Sync {
    /// Transmits the entry and waits for the acknowledgment.
    fn send(&self, entry: &OutboxEntry) -> SyncResult<MutationAck>;
}

/// What one drain pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged by the server.
    pub delivered: u64,
    /// Entries kept for retry after a retryable failure.
    pub retried: u64,
    /// Entries moved to the failed list.
    pub failed: u64,
}

struct OutboxState {
    // In-flight entries stay queued until acknowledged; a crash mid-send
    // must not lose them.
    queue: VecDeque<OutboxEntry>,
    // Request ids currently on the wire, keyed by record. Enqueues must not
    // coalesce into an in-flight entry and drains must not resend one.
    in_flight: BTreeMap<(String, i64), Uuid>,
}

/// Queue of unsynced local mutations.
pub struct Outbox {
    store: Arc<LocalStore>,
    config: OutboxConfig,
    state: Mutex<OutboxState>,
    failed: RwLock<Vec<OutboxEntry>>,
    next_placeholder: AtomicI64,
}

impl Outbox {
    /// Creates an empty outbox over the given store.
    pub fn new(store: Arc<LocalStore>, config: OutboxConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(OutboxState {
                queue: VecDeque::new(),
                in_flight: BTreeMap::new(),
            }),
            failed: RwLock::new(Vec::new()),
            next_placeholder: AtomicI64::new(-1),
        }
    }

    fn persist(&self, state: &OutboxState) -> SyncResult<()> {
        let rows = state
            .queue
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        self.store.set_outbox(rows)?;
        Ok(())
    }

    /// Restores the persisted queue and synthesizes entries for pending
    /// records of the model the snapshot does not cover. Called once per
    /// model after reopening the store, before anything drains.
    ///
    /// Restored entries keep their original request ids, so a mutation
    /// retransmitted after a restart still deduplicates server-side.
    pub fn recover(&self, model: &str) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let mut recovered = 0;

        for row in self.store.outbox_rows() {
            let entry: OutboxEntry = match serde_json::from_value(row) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable persisted outbox row");
                    continue;
                }
            };
            if state
                .queue
                .iter()
                .any(|e| e.request_id == entry.request_id)
            {
                continue;
            }
            // Keep fresh placeholders clear of recovered ones.
            if entry.record_id < 0 {
                self.next_placeholder
                    .fetch_min(entry.record_id - 1, Ordering::SeqCst);
            }
            if entry.model == model {
                recovered += 1;
            }
            state.queue.push_back(entry);
        }

        // The queue snapshot can lag the records (crash between the record
        // commit and the queue commit); records whose sync state says an
        // unsynced edit exists still get an entry, with a fresh request id.
        let pending = self
            .store
            .query(model, |r| r.sync_state.is_pending(), "id");
        for record in pending {
            if state
                .queue
                .iter()
                .any(|e| e.model == model && e.record_id == record.id)
            {
                continue;
            }
            if record.has_placeholder_id() {
                self.next_placeholder
                    .fetch_min(record.id - 1, Ordering::SeqCst);
            }
            let kind = match record.sync_state {
                SyncState::PendingCreate => OperationKind::Create,
                SyncState::PendingDelete => OperationKind::Delete,
                _ => OperationKind::Update,
            };
            let payload = if kind == OperationKind::Delete {
                FieldMap::new()
            } else {
                record.fields.clone()
            };
            state
                .queue
                .push_back(OutboxEntry::new(model, record.id, kind, payload));
            recovered += 1;
        }

        self.persist(&state)?;
        debug!(model, recovered, "recovered outbox entries");
        Ok(recovered)
    }

    /// Creates a record locally and queues its transmission.
    ///
    /// The record gets a negative placeholder id; the acknowledgment remaps
    /// it to the server-assigned id, rewriting references along the way.
    pub fn create(&self, model: &str, fields: FieldMap) -> SyncResult<Record> {
        let placeholder = self.next_placeholder.fetch_sub(1, Ordering::SeqCst);

        let mut record = Record::new(model, placeholder);
        record.fields = fields.clone();
        record.sync_state = SyncState::PendingCreate;
        self.store.upsert(record.clone())?;

        let entry = OutboxEntry::new(model, placeholder, OperationKind::Create, fields);
        debug!(model, placeholder, request_id = %entry.request_id, "queued create");
        let mut state = self.state.lock();
        state.queue.push_back(entry);
        self.persist(&state)?;
        Ok(record)
    }

    /// Applies a field update locally and queues its transmission.
    ///
    /// Coalesces into a queued entry for the same record when one exists
    /// and is not in flight. Returns the request id the update travels
    /// under. A record with an open conflict rejects edits until the
    /// conflict is resolved.
    pub fn update(&self, model: &str, record_id: i64, fields: FieldMap) -> SyncResult<Uuid> {
        let Some(existing) = self.store.get(model, record_id) else {
            return Err(StoreError::invalid_operation(format!(
                "no {model} record with id {record_id} to update"
            ))
            .into());
        };
        if existing.sync_state == SyncState::Conflict {
            return Err(SyncError::MergeConflict {
                model: model.to_string(),
                record_id,
            });
        }

        let mut record = existing;
        for (name, value) in &fields {
            record.fields.insert(name.clone(), value.clone());
        }
        if record.sync_state != SyncState::PendingCreate {
            record.sync_state = SyncState::PendingUpdate;
        }
        record.local_updated_at = unix_millis();
        self.store.upsert(record)?;

        let mut state = self.state.lock();
        let busy = state
            .in_flight
            .get(&(model.to_string(), record_id))
            .copied();
        let coalesced = state
            .queue
            .iter_mut()
            .find(|e| {
                e.model == model
                    && e.record_id == record_id
                    && busy.is_none_or(|id| id != e.request_id)
            })
            .map(|entry| {
                entry.coalesce(OperationKind::Update, fields.clone());
                entry.request_id
            });
        if let Some(request_id) = coalesced {
            self.persist(&state)?;
            return Ok(request_id);
        }

        let entry = OutboxEntry::new(model, record_id, OperationKind::Update, fields);
        let request_id = entry.request_id;
        state.queue.push_back(entry);
        self.persist(&state)?;
        Ok(request_id)
    }

    /// Deletes a record locally and queues the deletion.
    ///
    /// A delete that lands on a still-queued create cancels both: the
    /// server never heard of the record, so nothing travels and `None` is
    /// returned.
    pub fn delete(&self, model: &str, record_id: i64) -> SyncResult<Option<Uuid>> {
        {
            let mut state = self.state.lock();
            let busy = state
                .in_flight
                .get(&(model.to_string(), record_id))
                .copied();
            if let Some(position) = state.queue.iter().position(|e| {
                e.model == model
                    && e.record_id == record_id
                    && busy.is_none_or(|id| id != e.request_id)
            }) {
                let outcome =
                    state.queue[position].coalesce(OperationKind::Delete, FieldMap::new());
                match outcome {
                    CoalesceOutcome::Cancelled => {
                        state.queue.remove(position);
                        self.persist(&state)?;
                        drop(state);
                        self.store.delete(model, record_id)?;
                        debug!(model, record_id, "delete cancelled queued create");
                        return Ok(None);
                    }
                    CoalesceOutcome::Merged => {
                        let request_id = state.queue[position].request_id;
                        self.persist(&state)?;
                        drop(state);
                        self.mark_pending_delete(model, record_id)?;
                        return Ok(Some(request_id));
                    }
                }
            }
        }

        self.mark_pending_delete(model, record_id)?;
        let entry = OutboxEntry::new(model, record_id, OperationKind::Delete, FieldMap::new());
        let request_id = entry.request_id;
        let mut state = self.state.lock();
        state.queue.push_back(entry);
        self.persist(&state)?;
        Ok(Some(request_id))
    }

    fn mark_pending_delete(&self, model: &str, record_id: i64) -> SyncResult<()> {
        let Some(mut record) = self.store.get(model, record_id) else {
            return Err(StoreError::invalid_operation(format!(
                "no {model} record with id {record_id} to delete"
            ))
            .into());
        };
        record.sync_state = SyncState::PendingDelete;
        record.local_updated_at = unix_millis();
        self.store.upsert(record)?;
        Ok(())
    }

    /// Transmits sendable entries until the queue is empty or a retryable
    /// failure suggests the connection is down.
    ///
    /// Per-record FIFO is preserved: while an entry for a record is in
    /// flight, later entries for the same record wait. In-flight entries
    /// stay queued until acknowledged, so a crash mid-send loses nothing.
    pub fn drain_once(&self, sender: &dyn MutationSender) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let entry = {
                let mut state = self.state.lock();
                let next = state
                    .queue
                    .iter()
                    .find(|e| {
                        !state
                            .in_flight
                            .contains_key(&(e.model.clone(), e.record_id))
                    })
                    .cloned();
                let Some(entry) = next else {
                    break;
                };
                state
                    .in_flight
                    .insert((entry.model.clone(), entry.record_id), entry.request_id);
                entry
            };

            let result = sender.send(&entry);
            let key = (entry.model.clone(), entry.record_id);

            match result {
                Ok(ack) => {
                    self.finish_ack(&entry, ack)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let mut state = self.state.lock();
                    state.in_flight.remove(&key);
                    let Some(position) = state
                        .queue
                        .iter()
                        .position(|q| q.request_id == entry.request_id)
                    else {
                        // Discarded while in flight; nothing left to update.
                        continue;
                    };
                    state.queue[position].record_attempt();
                    let attempts = state.queue[position].attempts;
                    let exhausted = attempts >= self.config.max_attempts;

                    if !e.is_retryable() || exhausted {
                        let removed = state.queue.remove(position);
                        self.persist(&state)?;
                        drop(state);
                        if let Some(removed) = removed {
                            self.failed.write().push(removed);
                        }
                        let surfaced = if e.is_retryable() {
                            SyncError::OutboxFailed {
                                request_id: entry.request_id,
                            }
                        } else {
                            e
                        };
                        warn!(
                            request_id = %entry.request_id,
                            attempts,
                            error = %surfaced,
                            "outbox entry failed permanently"
                        );
                        report.failed += 1;
                    } else {
                        self.persist(&state)?;
                        debug!(
                            request_id = %entry.request_id,
                            attempts,
                            error = %e,
                            "outbox entry kept for retry"
                        );
                        report.retried += 1;
                        // The connection is likely down; stop and let the
                        // next drain pick the queue up.
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Applies a server acknowledgment: dequeues the entry and settles the
    /// local record.
    fn finish_ack(&self, entry: &OutboxEntry, ack: MutationAck) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(position) = state
                .queue
                .iter()
                .position(|q| q.request_id == entry.request_id)
            {
                state.queue.remove(position);
            }
            if entry.kind == OperationKind::Create && entry.record_id != ack.server_id {
                // Entries queued behind the create still name the
                // placeholder.
                for queued in state.queue.iter_mut() {
                    if queued.model == entry.model && queued.record_id == entry.record_id {
                        queued.record_id = ack.server_id;
                    }
                }
            }
            state.in_flight.remove(&(entry.model.clone(), entry.record_id));
            self.persist(&state)?;
        }

        match entry.kind {
            OperationKind::Create => {
                if entry.record_id != ack.server_id {
                    self.store
                        .remap_id(&entry.model, entry.record_id, ack.server_id)?;
                }
                self.mark_synced(&entry.model, ack)?;
            }
            OperationKind::Update => {
                self.mark_synced(&entry.model, ack)?;
            }
            OperationKind::Delete => {
                self.store.delete(&entry.model, ack.server_id)?;
            }
        }
        Ok(())
    }

    /// Marks a record clean unless further edits are already queued behind
    /// the acknowledged one.
    fn mark_synced(&self, model: &str, ack: MutationAck) -> SyncResult<()> {
        let has_queued = self
            .state
            .lock()
            .queue
            .iter()
            .any(|e| e.model == model && e.record_id == ack.server_id);

        let Some(mut record) = self.store.get(model, ack.server_id) else {
            return Ok(());
        };
        record.updated_at = Some(ack.updated_at);
        if !has_queued {
            record.sync_state = SyncState::Clean;
        }
        self.store.upsert(record)?;
        Ok(())
    }

    /// Returns the number of queued entries, in-flight ones included.
    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns entries that exhausted their retries or were rejected.
    pub fn failed(&self) -> Vec<OutboxEntry> {
        self.failed.read().clone()
    }

    /// Returns the number of permanently failed entries.
    pub fn failed_count(&self) -> usize {
        self.failed.read().len()
    }

    /// Moves a failed entry back into the queue with its attempts reset.
    ///
    /// Returns false when no failed entry carries the request id.
    pub fn retry_failed(&self, request_id: Uuid) -> SyncResult<bool> {
        let mut entry = {
            let mut failed = self.failed.write();
            let Some(position) = failed.iter().position(|e| e.request_id == request_id) else {
                return Ok(false);
            };
            failed.remove(position)
        };
        entry.attempts = 0;
        let mut state = self.state.lock();
        state.queue.push_back(entry);
        self.persist(&state)?;
        Ok(true)
    }

    /// Drops a failed entry, abandoning the local mutation it carried.
    ///
    /// The caller is responsible for repairing the record's sync state,
    /// typically by pulling the model again.
    pub fn discard_failed(&self, request_id: Uuid) -> Option<OutboxEntry> {
        let mut failed = self.failed.write();
        let position = failed.iter().position(|e| e.request_id == request_id)?;
        Some(failed.remove(position))
    }
}
