//! Aula server-side cache.
//!
//! Two cooperating structures:
//!
//! - **Tag registry**: bidirectional mapping between opaque cache tags and
//!   the response entries they cover, enabling group invalidation.
//! - **Response cache**: LRU-bounded store of computed responses with
//!   in-flight deduplication, so a purged popular key is recomputed once
//!   instead of once per concurrent caller.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `aula.toml`:
//!
//! ```toml
//! [cache]
//! enable_response_cache = true
//! response_limit = 512
//! ```

mod config;
pub(crate) mod lock;
mod response;
mod tags;

pub use config::CacheConfig;
pub use response::{CacheStats, CachedResponse, ComputeError, ResponseCache, ResponseKey};
pub use tags::{CacheTag, TagParseError, TagRegistry};
