//! Realtime table-cache pipeline.
//!
//! Mirrors database tables into per-session caches fed by the change
//! stream. The pipeline converges to the authoritative database state
//! because every conflict is decided by commit order, and it degrades to
//! stale-but-consistent data when the stream or the row source misbehaves.

mod controller;
mod source;
mod table;

pub use controller::{
    Controller, ControllerError, LiveConfig, MutationOutcome, SubscriptionState, TableSpec,
};
pub use source::{FetchError, RefetchPolicy, RowSource, fetch_with_retry};
pub use table::{ApplyOutcome, RowChange, Speculation, TableCache, TableRow, TableSnapshot};
