//! Cache-consistency core for the Aula course platform.
//!
//! Two independent paths keep cached readers converged with the
//! authoritative database:
//!
//! - **Server side**: a tag-addressed [`cache::ResponseCache`] fronted by the
//!   [`gateway`] webhook endpoints. Database triggers call the gateway with
//!   cache tags; the gateway purges every response entry covered by those
//!   tags so the next request recomputes fresh data.
//! - **Client side**: a [`live::Controller`] that mirrors tables of interest
//!   into ordered in-memory [`live::TableCache`]s, reconciled from a
//!   row-level [`stream`] change feed and periodic full refetches.
//!
//! Both paths tolerate at-least-once delivery: purging an already-purged tag
//! is a no-op, and change events are discarded whenever their commit order
//! does not advance past the state already applied.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod live;
pub mod policy;
pub mod stream;
pub mod telemetry;
