//! HTTP invalidation gateway.
//!
//! The write path (database triggers, admin tooling) reaches the response
//! cache only through this surface. Requests authenticate with a shared
//! secret per endpoint and carry the tags to purge; responses report a
//! per-tag outcome so the sender can retry just the failures.

mod error;
mod handlers;

pub use error::{GatewayError, codes};
pub use handlers::{
    GatewayState, INVALIDATION_SECRET_HEADER, InvalidateRequest, InvalidateResponse, PurgeTarget,
    REVALIDATION_SECRET_HEADER, RevalidateRequest, StatsResponse, TagResult, TransientStoreError,
    build_router,
};
