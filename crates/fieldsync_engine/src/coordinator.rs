//! Sync coordinator: applies server-originated changes to the local store.
//!
//! Sits between the bus client and the store. Filters duplicate and
//! stale-epoch deliveries, decodes payloads, and runs the merge policy. The
//! merge is keyed purely on `updated_at`: a remote change only ever wins
//! over local state it is strictly newer than, and a collision with an
//! unsynced local edit becomes an explicit conflict instead of silent data
//! loss.

use crate::bus::EpochStamped;
use crate::error::SyncResult;
use fieldsync_protocol::{
    BusEvent, ConflictResolution, CursorTable, EventPayload, RecordConflict, RemoteChange,
    RemoteRecord, ServerMessage,
};
use fieldsync_store::{LocalStore, Record, SyncState};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the merge policy decided for one remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The change was written to the store.
    Applied,
    /// The change was older than local state and ignored.
    Discarded,
    /// The change collided with an unsynced local edit; recorded as a
    /// conflict for explicit resolution.
    Conflict,
    /// A remote deletion was carried out locally.
    Deleted,
}

/// Running counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Changes written to the store.
    pub applied: u64,
    /// Changes discarded as older than local state.
    pub discarded: u64,
    /// Conflicts recorded.
    pub conflicts: u64,
    /// Remote deletions applied.
    pub deleted: u64,
    /// Duplicate deliveries dropped by cursor filtering.
    pub deduped: u64,
    /// Messages dropped because they carried a superseded epoch.
    pub stale_epoch: u64,
    /// Payloads dropped as malformed.
    pub malformed: u64,
}

/// Fetches a full snapshot of a model from the server.
///
/// Used for the initial pull and for catch-up when replay cannot cover the
/// gap. The transport behind it is the caller's concern.
pub trait SnapshotFetcher: Send + Sync {
    /// Returns every live record of the model.
    fn fetch(&self, model: &str) -> SyncResult<Vec<RemoteRecord>>;
}

/// Result of reconciling a snapshot against the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Records written.
    pub applied: u64,
    /// Records skipped as not newer than local state.
    pub discarded: u64,
    /// Conflicts recorded.
    pub conflicts: u64,
    /// Local rows removed because the server no longer has them.
    pub removed: u64,
}

/// Applies remote changes to the local store under the merge policy.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    cursors: Arc<RwLock<CursorTable>>,
    conflicts: RwLock<Vec<RecordConflict>>,
    stats: RwLock<CoordinatorStats>,
    current_epoch: AtomicU64,
}

impl SyncCoordinator {
    /// Creates a coordinator over the given store and cursor table.
    ///
    /// The cursor table must be the same one handed to the bus client so
    /// resubscription picks up from what was actually applied.
    pub fn new(store: Arc<LocalStore>, cursors: Arc<RwLock<CursorTable>>) -> Self {
        Self {
            store,
            cursors,
            conflicts: RwLock::new(Vec::new()),
            stats: RwLock::new(CoordinatorStats::default()),
            current_epoch: AtomicU64::new(0),
        }
    }

    /// Handles one epoch-tagged message from the bus client.
    ///
    /// Messages from a superseded connection epoch are dropped: the replay
    /// on the newer connection covers anything they carried. Returns the
    /// merge outcome when the message was an event that got merged.
    pub fn handle_message(
        &self,
        stamped: &EpochStamped<ServerMessage>,
    ) -> SyncResult<Option<MergeOutcome>> {
        let seen = self
            .current_epoch
            .fetch_max(stamped.epoch, Ordering::SeqCst);
        if stamped.epoch < seen {
            debug!(
                epoch = stamped.epoch,
                current = seen,
                "dropping stale-epoch message"
            );
            self.stats.write().stale_epoch += 1;
            return Ok(None);
        }

        match &stamped.message {
            ServerMessage::Event(event) => self.handle_event(event),
            _ => Ok(None),
        }
    }

    /// Handles one channel event: dedup, decode, merge.
    pub fn handle_event(&self, event: &BusEvent) -> SyncResult<Option<MergeOutcome>> {
        if !self
            .cursors
            .write()
            .should_apply(&event.channel, event.sequence)
        {
            self.stats.write().deduped += 1;
            return Ok(None);
        }

        let payload = match EventPayload::decode(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    channel = %event.channel,
                    sequence = event.sequence,
                    error = %e,
                    "dropping malformed event payload"
                );
                self.stats.write().malformed += 1;
                return Ok(None);
            }
        };

        let outcome = self.apply_change(&payload.model, &payload.change)?;
        Ok(Some(outcome))
    }

    /// Runs the merge policy for one remote change.
    pub fn apply_change(&self, model: &str, change: &RemoteChange) -> SyncResult<MergeOutcome> {
        let outcome = match change {
            RemoteChange::Upsert { record } => self.merge_upsert(model, record)?,
            RemoteChange::Delete { id } => self.merge_delete(model, *id)?,
        };

        let mut stats = self.stats.write();
        match outcome {
            MergeOutcome::Applied => stats.applied += 1,
            MergeOutcome::Discarded => stats.discarded += 1,
            MergeOutcome::Conflict => stats.conflicts += 1,
            MergeOutcome::Deleted => stats.deleted += 1,
        }
        Ok(outcome)
    }

    fn merge_upsert(&self, model: &str, remote: &RemoteRecord) -> SyncResult<MergeOutcome> {
        let Some(local) = self.store.get(model, remote.id) else {
            let mut record = Record::new(model, remote.id).with_updated_at(remote.updated_at);
            record.fields = remote.fields.clone();
            self.store.upsert(record)?;
            return Ok(MergeOutcome::Applied);
        };

        if local.sync_state.is_clean() {
            // Same-or-older remote versions are replays; dropping them keeps
            // out-of-order delivery convergent.
            let newer = local.updated_at.is_none_or(|t| remote.updated_at > t);
            if !newer {
                return Ok(MergeOutcome::Discarded);
            }
            let mut record = Record::new(model, remote.id).with_updated_at(remote.updated_at);
            record.fields = remote.fields.clone();
            self.store.upsert(record)?;
            return Ok(MergeOutcome::Applied);
        }

        // Unsynced local edit. Only a remote change strictly newer than the
        // local edit is a real collision; anything else is the state the
        // edit was based on, echoed back.
        if remote.updated_at <= local.local_updated_at {
            return Ok(MergeOutcome::Discarded);
        }

        let conflict = RecordConflict {
            model: model.to_string(),
            record_id: remote.id,
            local_fields: local.fields.clone(),
            remote_fields: remote.fields.clone(),
            local_updated_at: local.local_updated_at,
            remote_updated_at: remote.updated_at,
        };
        warn!(model, record_id = remote.id, "merge conflict recorded");

        let mut conflicted = local.clone();
        conflicted.sync_state = SyncState::Conflict;
        conflicted.shadow = Some(remote.fields.clone());
        self.store.upsert(conflicted)?;

        // One open conflict per record: a newer remote version arriving
        // while the conflict is unresolved refreshes the remote side.
        let mut conflicts = self.conflicts.write();
        match conflicts
            .iter_mut()
            .find(|c| c.model == model && c.record_id == remote.id)
        {
            Some(open) => *open = conflict,
            None => conflicts.push(conflict),
        }
        Ok(MergeOutcome::Conflict)
    }

    fn merge_delete(&self, model: &str, id: i64) -> SyncResult<MergeOutcome> {
        match self.store.get(model, id) {
            // The server cannot be deleting a record it has never seen.
            Some(local) if local.sync_state == SyncState::PendingCreate => {
                Ok(MergeOutcome::Discarded)
            }
            Some(_) => {
                self.store.delete(model, id)?;
                self.conflicts
                    .write()
                    .retain(|c| !(c.model == model && c.record_id == id));
                Ok(MergeOutcome::Deleted)
            }
            None => Ok(MergeOutcome::Discarded),
        }
    }

    /// Pulls a full snapshot of a model and reconciles it.
    pub fn pull_model(
        &self,
        fetcher: &dyn SnapshotFetcher,
        model: &str,
    ) -> SyncResult<SnapshotReport> {
        let records = fetcher.fetch(model)?;
        self.reconcile_snapshot(model, records)
    }

    /// Merges a full server snapshot of a model.
    ///
    /// Every snapshot record goes through the normal merge policy. Local
    /// rows absent from the snapshot are treated as server-deleted and
    /// removed, matching what a pushed delete does; only `PendingCreate`
    /// rows are spared, since the server has never seen them.
    pub fn reconcile_snapshot(
        &self,
        model: &str,
        records: Vec<RemoteRecord>,
    ) -> SyncResult<SnapshotReport> {
        let mut report = SnapshotReport::default();
        let server_ids: BTreeSet<i64> = records.iter().map(|r| r.id).collect();

        for record in records {
            match self.merge_upsert(model, &record)? {
                MergeOutcome::Applied => report.applied += 1,
                MergeOutcome::Discarded => report.discarded += 1,
                MergeOutcome::Conflict => report.conflicts += 1,
                MergeOutcome::Deleted => {}
            }
        }

        let stale: Vec<i64> = self
            .store
            .query(model, |r| !server_ids.contains(&r.id), "id")
            .into_iter()
            .filter(|r| r.sync_state != SyncState::PendingCreate)
            .map(|r| r.id)
            .collect();
        for id in &stale {
            self.store.delete(model, *id)?;
            report.removed += 1;
        }
        if !stale.is_empty() {
            self.conflicts
                .write()
                .retain(|c| !(c.model == model && stale.contains(&c.record_id)));
        }

        debug!(model, ?report, "reconciled snapshot");
        Ok(report)
    }

    /// Returns the open conflicts.
    pub fn conflicts(&self) -> Vec<RecordConflict> {
        self.conflicts.read().clone()
    }

    /// Returns the number of open conflicts.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.read().len()
    }

    /// Resolves an open conflict and returns the record afterwards.
    ///
    /// `KeepLocal` marks the record dirty again so the local version gets
    /// pushed; the caller is expected to enqueue the update. `AcceptRemote`
    /// replaces the local fields with the preserved remote version and marks
    /// the record clean.
    pub fn resolve_conflict(
        &self,
        model: &str,
        record_id: i64,
        resolution: ConflictResolution,
    ) -> SyncResult<Option<Record>> {
        let position = {
            let conflicts = self.conflicts.read();
            conflicts
                .iter()
                .position(|c| c.model == model && c.record_id == record_id)
        };
        let Some(position) = position else {
            return Ok(None);
        };
        let conflict = self.conflicts.write().remove(position);

        let Some(local) = self.store.get(model, record_id) else {
            return Ok(None);
        };

        let resolved = match resolution {
            ConflictResolution::KeepLocal => {
                let mut record = local;
                record.sync_state = SyncState::Dirty;
                record.shadow = None;
                record.local_updated_at = fieldsync_store::unix_millis();
                record
            }
            ConflictResolution::AcceptRemote => {
                let mut record = local;
                record.fields = conflict.remote_fields.clone();
                record.updated_at = Some(conflict.remote_updated_at);
                record.sync_state = SyncState::Clean;
                record.shadow = None;
                record
            }
        };

        self.store.upsert(resolved.clone())?;
        debug!(model, record_id, ?resolution, "conflict resolved");
        Ok(Some(resolved))
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> CoordinatorStats {
        *self.stats.read()
    }
}
