//! # fieldsync engine
//!
//! Client-side synchronization engine for the fieldsync offline-first
//! stack: bus client, sync coordinator, and outbox.
//!
//! This crate provides:
//! - A reconnecting bus client ([`BusClient`]) with explicit connection
//!   states, cursor-based resubscription, and epoch-tagged events
//! - A coordinator ([`SyncCoordinator`]) that merges server changes into the
//!   local store under a timestamp-keyed policy and surfaces conflicts
//! - A durable mutation queue ([`Outbox`]) with coalescing, per-record FIFO,
//!   idempotent retries, and placeholder-id remapping on acknowledgment
//! - A facade ([`SyncEngine`]) wiring the three together on background
//!   threads
//!
//! ## Key invariants
//!
//! - Network errors surface as state transitions, never as panics; callers
//!   observe them on the state stream
//! - Each distinct (channel, sequence) is applied exactly once, across any
//!   number of reconnects and replays
//! - A local unsynced edit is never silently overwritten; collisions become
//!   explicit conflicts
//! - Outbox retransmissions reuse the original request id, so the server can
//!   deduplicate

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod config;
mod coordinator;
mod engine;
mod error;
mod outbox;
mod transport;

pub use bus::{BusClient, BusStateChange, ConnectionState, EpochStamped};
pub use config::{BackoffConfig, BusConfig, OutboxConfig};
pub use coordinator::{
    CoordinatorStats, MergeOutcome, SnapshotFetcher, SnapshotReport, SyncCoordinator,
};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use outbox::{DrainReport, MutationSender, Outbox};
pub use transport::{BusConnection, BusTransport, ScriptStep, ScriptedTransport};

pub use fieldsync_protocol::{
    BusEvent, ClientMessage, ConflictResolution, CursorTable, DecodeError, EventPayload,
    MutationAck, OperationKind, OutboxEntry, RecordConflict, RemoteChange, RemoteRecord,
    ServerMessage,
};
