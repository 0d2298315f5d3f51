//! # fieldsync protocol
//!
//! Wire messages, delivery cursors, outbox operations, and conflict types
//! shared between the fieldsync engine and anything that speaks to the
//! remote event bus.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod cursor;
mod messages;
mod operation;

pub use conflict::{ConflictResolution, RecordConflict};
pub use cursor::{CursorTable, SubscriptionState};
pub use messages::{
    BusEvent, ClientMessage, DecodeError, EventPayload, FieldMap, RemoteChange, RemoteRecord,
    ServerMessage,
};
pub use operation::{CoalesceOutcome, MutationAck, OperationKind, OutboxEntry};
