//! Change feed for observing committed store writes.
//!
//! The feed emits one event per committed write, routed by model, enabling
//! reactive UI updates and sync-layer integration. Events are emitted only
//! after the triggering write is durably committed.

use crate::record::Record;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of change applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Record did not exist before.
    Added,
    /// Record existed and was modified.
    Updated,
    /// Record was removed.
    Removed,
}

/// A single change notification from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    /// Kind of change.
    pub kind: ChangeKind,
    /// The record after the change (for `Removed`, the last version).
    pub record: Record,
}

/// Distributes committed changes to per-model subscribers.
///
/// Subscribers receive a lazy, unbounded stream; disconnected receivers are
/// pruned on the next emit for their model.
pub struct ChangeFeed {
    subscribers: RwLock<BTreeMap<String, Vec<Sender<RecordChange>>>>,
}

impl ChangeFeed {
    /// Creates an empty change feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Subscribes to changes for a model.
    ///
    /// The receiver yields all future changes for that model, in commit
    /// order.
    pub fn subscribe(&self, model: &str) -> Receiver<RecordChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .write()
            .entry(model.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Emits a change to all subscribers of its model.
    pub fn emit(&self, change: RecordChange) {
        let mut subscribers = self.subscribers.write();
        if let Some(senders) = subscribers.get_mut(&change.record.model) {
            senders.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }

    /// Returns the number of live subscribers for a model.
    pub fn subscriber_count(&self, model: &str) -> usize {
        self.subscribers
            .read()
            .get(model)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
