//! Per-channel delivery cursors.
//!
//! A cursor marks the last contiguously acknowledged sequence on a channel.
//! Reconnects resubscribe from the cursor, never ahead of it; replayed or
//! out-of-order deliveries are filtered so each distinct
//! (channel, sequence) is applied exactly once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Delivery state for one logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// Channel id.
    pub channel: String,
    /// Last contiguously applied sequence. Monotonically non-decreasing
    /// within a connection epoch.
    pub cursor: u64,
    /// Connection epoch the channel was last active on.
    pub epoch: u64,
    /// Applied sequences above the cursor (out-of-order arrivals awaiting
    /// the gap to fill).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    ahead: BTreeSet<u64>,
}

impl SubscriptionState {
    /// Creates a fresh state for a channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            cursor: 0,
            epoch: 0,
            ahead: BTreeSet::new(),
        }
    }

    /// Records a delivery. Returns true if the sequence has not been applied
    /// before (the caller should apply it), false for duplicates.
    pub fn observe(&mut self, sequence: u64) -> bool {
        if sequence <= self.cursor || self.ahead.contains(&sequence) {
            return false;
        }
        self.ahead.insert(sequence);
        while self.ahead.remove(&(self.cursor + 1)) {
            self.cursor += 1;
        }
        true
    }
}

/// Cursor state across all subscribed channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorTable {
    channels: BTreeMap<String, SubscriptionState>,
}

impl CursorTable {
    /// Creates a table with the given channel set.
    pub fn new(channels: &[String]) -> Self {
        let mut table = Self::default();
        for channel in channels {
            table.ensure(channel);
        }
        table
    }

    /// Ensures a channel is tracked.
    pub fn ensure(&mut self, channel: &str) {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| SubscriptionState::new(channel));
    }

    /// Returns the cursor for a channel (0 if untracked).
    pub fn cursor(&self, channel: &str) -> u64 {
        self.channels.get(channel).map(|s| s.cursor).unwrap_or(0)
    }

    /// Returns the last acknowledged cursor per channel, for the subscribe
    /// request.
    pub fn last_cursors(&self) -> BTreeMap<String, u64> {
        self.channels
            .iter()
            .map(|(channel, state)| (channel.clone(), state.cursor))
            .collect()
    }

    /// Stamps all channels with a new connection epoch.
    pub fn begin_epoch(&mut self, epoch: u64) {
        for state in self.channels.values_mut() {
            state.epoch = epoch;
        }
    }

    /// Records a delivery on a channel. Returns true exactly once per
    /// distinct (channel, sequence).
    pub fn should_apply(&mut self, channel: &str, sequence: u64) -> bool {
        self.ensure(channel);
        self.channels
            .get_mut(channel)
            .map(|s| s.observe(sequence))
            .unwrap_or(false)
    }
}
