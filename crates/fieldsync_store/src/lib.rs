//! # fieldsync store
//!
//! Versioned local persistent store for the fieldsync offline-first client.
//!
//! This crate provides:
//! - A typed CRUD store ([`LocalStore`]) with field-level merge upserts
//! - A post-commit change feed per model
//! - Pluggable snapshot persistence ([`StorageBackend`])
//! - Ordered, idempotent schema migrations ([`MigrationRunner`])
//!
//! ## Key invariants
//!
//! - All mutations go through a single write lock; readers never observe a
//!   partially merged record
//! - Change events are delivered only after the backend commit
//! - Migration runs to completion before anything else touches the store;
//!   a failed step is fatal
//! - Conflict resolution is the coordinator's job; the store itself is
//!   last-write-wins

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod change_feed;
mod error;
mod migration;
mod record;
mod store;

pub use backend::{FileBackend, MemoryBackend, PersistedState, StorageBackend};
pub use change_feed::{ChangeKind, RecordChange};
pub use error::{StoreError, StoreResult};
pub use migration::{Migration, MigrationRunner};
pub use record::{unix_millis, FieldMap, Record, SyncState};
pub use store::{LocalStore, MigrationTxn};
