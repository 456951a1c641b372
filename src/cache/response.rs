//! Response cache with in-flight deduplication.
//!
//! Stores computed responses keyed by a request-derived [`ResponseKey`] and
//! tagged through the [`TagRegistry`]. Entries are never mutated in place:
//! they are created on a cache-miss compute and removed when a covering tag
//! is purged or the LRU evicts them.
//!
//! `get_or_compute` guarantees at most one computation in flight per key.
//! After a popular tag is purged, the first caller recomputes and every
//! concurrent caller for the same key waits on that result instead of piling
//! on (the "thundering herd" problem).

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};
use super::tags::{CacheTag, TagRegistry};

const SOURCE: &str = "cache::response";

const METRIC_HIT: &str = "aula_cache_response_hit_total";
const METRIC_MISS: &str = "aula_cache_response_miss_total";
const METRIC_EVICT: &str = "aula_cache_response_evict_total";
const METRIC_PURGED: &str = "aula_cache_response_purged_total";
const METRIC_FLIGHT_WAIT: &str = "aula_cache_inflight_wait_total";

/// Request-derived cache key, e.g. a normalized path plus a query hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseKey(String);

impl ResponseKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A computed response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

struct CacheEntry {
    value: CachedResponse,
    #[allow(dead_code)]
    created_at: OffsetDateTime,
    #[allow(dead_code)]
    tags: HashSet<CacheTag>,
}

/// Failure of a cache-miss computation.
///
/// Cloneable so one leader failure can be delivered to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("compute failed: {0}")]
    Failed(String),
    #[error("computation cancelled before producing a result")]
    Cancelled,
}

impl ComputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

type FlightResult = Result<CachedResponse, ComputeError>;

/// Server-process-wide response cache.
///
/// Shared by every request-handling task; all mutation is single-operation
/// atomic. Compound sequences are not atomic unless provided as one
/// operation (`get_or_compute` is the only such compound).
pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<LruCache<ResponseKey, CacheEntry>>,
    registry: Arc<TagRegistry>,
    inflight: DashMap<ResponseKey, broadcast::Sender<FlightResult>>,
}

/// Counts reported by the stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub tags: usize,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, registry: Arc<TagRegistry>) -> Self {
        Self {
            config: config.clone(),
            entries: RwLock::new(LruCache::new(config.response_limit_non_zero())),
            registry,
            inflight: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TagRegistry> {
        &self.registry
    }

    pub fn get(&self, key: &ResponseKey) -> Option<CachedResponse> {
        rw_write(&self.entries, SOURCE, "get")
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// At most one computation runs per key at a time: concurrent callers
    /// wait on the leader's result. If the compute fails, nothing is cached
    /// and the failure propagates to every waiter. If the leader is
    /// cancelled mid-flight, waiters receive [`ComputeError::Cancelled`]
    /// rather than blocking forever.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: ResponseKey,
        tags: Vec<CacheTag>,
        compute: F,
    ) -> Result<CachedResponse, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, ComputeError>>,
    {
        if !self.config.enable_response_cache {
            return compute().await;
        }

        if let Some(hit) = self.get(&key) {
            counter!(METRIC_HIT).increment(1);
            return Ok(hit);
        }
        counter!(METRIC_MISS).increment(1);

        enum Role {
            Leader(broadcast::Sender<FlightResult>),
            Waiter(broadcast::Receiver<FlightResult>),
        }

        // The shard lock held by `entry` must not outlive this block: the
        // compute below suspends.
        let role = match self.inflight.entry(key.clone()) {
            Entry::Occupied(flight) => Role::Waiter(flight.get().subscribe()),
            Entry::Vacant(slot) => {
                let (tx, _) = broadcast::channel(1);
                slot.insert(tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                counter!(METRIC_FLIGHT_WAIT).increment(1);
                match rx.recv().await {
                    Ok(result) => result,
                    // Leader went away without publishing.
                    Err(_) => Err(ComputeError::Cancelled),
                }
            }
            Role::Leader(tx) => {
                let flight = FlightGuard {
                    inflight: &self.inflight,
                    key: key.clone(),
                };
                let result = compute().await;
                if let Ok(value) = &result {
                    self.store(key, tags, value.clone());
                }
                // Clear the flight before publishing so a caller arriving
                // after the broadcast finds the stored entry instead of a
                // closed channel.
                drop(flight);
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    /// Purge every entry covered by `tag`. Returns the number of entries
    /// removed; purging an unknown or already-purged tag is a no-op.
    pub fn purge_tag(&self, tag: &CacheTag) -> usize {
        let keys = self.registry.purge(std::slice::from_ref(tag));
        if keys.is_empty() {
            return 0;
        }

        let mut entries = rw_write(&self.entries, SOURCE, "purge_tag");
        let mut removed = 0usize;
        for key in &keys {
            if entries.pop(key).is_some() {
                removed += 1;
            }
        }
        counter!(METRIC_PURGED).increment(removed as u64);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: rw_read(&self.entries, SOURCE, "stats").len(),
            tags: self.registry.tag_count(),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, key: ResponseKey, tags: Vec<CacheTag>, value: CachedResponse) {
        let tag_set: HashSet<CacheTag> = tags.into_iter().collect();
        self.registry.tag(key.clone(), tag_set.clone());

        let entry = CacheEntry {
            value,
            created_at: OffsetDateTime::now_utc(),
            tags: tag_set,
        };
        let evicted = rw_write(&self.entries, SOURCE, "store").push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            counter!(METRIC_EVICT).increment(1);
            self.registry.release(&evicted_key);
        }
    }
}

struct FlightGuard<'a> {
    inflight: &'a DashMap<ResponseKey, broadcast::Sender<FlightResult>>,
    key: ResponseKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn new_cache() -> ResponseCache {
        ResponseCache::new(&CacheConfig::default(), Arc::new(TagRegistry::new()))
    }

    fn tag(raw: &str) -> CacheTag {
        CacheTag::parse(raw).expect("valid tag")
    }

    fn body(text: &str) -> CachedResponse {
        CachedResponse::new(200, vec![], text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn compute_once_then_hit() {
        let cache = new_cache();
        let computes = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(
                    ResponseKey::new("/courses/41"),
                    vec![tag("course:41")],
                    || async {
                        computes.fetch_add(1, Ordering::SeqCst);
                        Ok(body("roster"))
                    },
                )
                .await
                .expect("compute succeeds");
            assert_eq!(value.body, Bytes::from("roster"));
        }

        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn purge_tag_removes_covered_entries() {
        let cache = new_cache();
        cache
            .get_or_compute(
                ResponseKey::new("/courses/41/staff"),
                vec![tag("course:41:staff")],
                || async { Ok(body("staff")) },
            )
            .await
            .expect("compute succeeds");

        assert_eq!(cache.purge_tag(&tag("course:41:staff")), 1);
        assert!(cache.get(&ResponseKey::new("/courses/41/staff")).is_none());
        // Duplicate delivery: already-purged tag is a successful no-op.
        assert_eq!(cache.purge_tag(&tag("course:41:staff")), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_compute() {
        let cache = Arc::new(new_cache());
        let computes = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let computes = computes.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute(
                        ResponseKey::new("/courses/41"),
                        vec![tag("course:41")],
                        move || async move {
                            computes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(body("shared"))
                        },
                    )
                    .await
            }));
        }

        for task in tasks {
            let value = task.await.expect("task").expect("compute succeeds");
            assert_eq!(value.body, Bytes::from("shared"));
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_compute_caches_nothing_and_reaches_waiters() {
        let cache = Arc::new(new_cache());

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(ResponseKey::new("/broken"), vec![], || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(ComputeError::failed("store unavailable"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(ResponseKey::new("/broken"), vec![], || async {
                        panic!("waiter must not compute while a flight is active")
                    })
                    .await
            })
        };

        assert!(leader.await.expect("leader task").is_err());
        assert_eq!(
            waiter.await.expect("waiter task"),
            Err(ComputeError::failed("store unavailable"))
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn lru_eviction_releases_registry_mappings() {
        let config = CacheConfig {
            response_limit: 1,
            ..Default::default()
        };
        let registry = Arc::new(TagRegistry::new());
        let cache = ResponseCache::new(&config, registry.clone());

        cache
            .get_or_compute(ResponseKey::new("/a"), vec![tag("a")], || async {
                Ok(body("a"))
            })
            .await
            .expect("compute succeeds");
        cache
            .get_or_compute(ResponseKey::new("/b"), vec![tag("b")], || async {
                Ok(body("b"))
            })
            .await
            .expect("compute succeeds");

        assert_eq!(cache.len(), 1);
        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.tag_count(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_always_recomputes() {
        let config = CacheConfig {
            enable_response_cache: false,
            ..Default::default()
        };
        let cache = ResponseCache::new(&config, Arc::new(TagRegistry::new()));
        let computes = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_compute(ResponseKey::new("/x"), vec![], || async {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok(body("x"))
                })
                .await
                .expect("compute succeeds");
        }
        assert_eq!(computes.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
