//! Realtime change stream.
//!
//! Row-level change events flow from a transport (the realtime feed in
//! production, an in-memory broadcast in tests) through a pump task into an
//! [`EventSink`]. The transport is at-least-once and may reorder nothing
//! within a table but guarantees nothing across tables; after a reconnect it
//! signals `Resync` instead of replaying what was missed.

mod client;
mod event;
pub mod memory;

pub use client::{
    ChangeStreamClient, ChangeTransport, EventSink, StreamSignal, SubscriptionHandle,
    TransportError,
};
pub use event::{ChangeEvent, CommitOrder, Operation, RowKey};
