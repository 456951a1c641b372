//! Client-side table cache.
//!
//! An ordered in-memory mirror of one table (or filtered query result),
//! kept consistent with the database by replaying change events. The commit
//! order carried by every event decides all conflicts: an event at or below
//! what the cache has already seen for a key is stale and dropped. Deletes
//! leave a tombstone for a bounded TTL so a late stale insert cannot
//! resurrect a deleted row.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::trace;

use crate::stream::{ChangeEvent, CommitOrder, Operation, RowKey};

/// One cached row with the commit order that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub key: RowKey,
    pub data: Value,
    pub commit_order: CommitOrder,
}

/// Authoritative fetch result: full row set plus the commit-order watermark
/// the snapshot was taken at.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub rows: Vec<(RowKey, Value)>,
    pub watermark: CommitOrder,
}

/// What `apply_event` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Commit order at or below what the cache already reflects.
    Stale,
    /// The event carried no usable row key.
    Unkeyed,
}

/// A local mutation to apply speculatively before the server confirms it.
#[derive(Debug, Clone)]
pub enum RowChange {
    Upsert { key: RowKey, data: Value },
    Delete { key: RowKey },
}

impl RowChange {
    pub fn key(&self) -> &RowKey {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Captured state of a speculative apply, sufficient to restore the
/// pre-mutation row exactly.
#[derive(Debug)]
pub struct Speculation {
    key: RowKey,
    prior: Option<TableRow>,
    base_order: CommitOrder,
}

struct Tombstone {
    commit_order: CommitOrder,
    expires_at: Instant,
}

pub struct TableCache {
    key_field: String,
    rows: BTreeMap<RowKey, TableRow>,
    tombstones: HashMap<RowKey, Tombstone>,
    /// Commit order of the last authoritative snapshot. Events at or below
    /// this are stale regardless of key.
    watermark: CommitOrder,
    tombstone_ttl: Duration,
}

impl TableCache {
    pub fn new(key_field: impl Into<String>, tombstone_ttl: Duration) -> Self {
        Self {
            key_field: key_field.into(),
            rows: BTreeMap::new(),
            tombstones: HashMap::new(),
            watermark: 0,
            tombstone_ttl,
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn watermark(&self) -> CommitOrder {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<&TableRow> {
        self.rows.get(key)
    }

    /// Replay one authoritative change event. Synchronous and total: by the
    /// time this returns the event is either reflected or rejected.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        self.prune_tombstones();

        let Some(key) = event.row_key(&self.key_field) else {
            return ApplyOutcome::Unkeyed;
        };

        let floor = self.last_seen(&key);
        if event.commit_order <= floor {
            trace!(
                key = %key,
                commit_order = event.commit_order,
                floor,
                "dropping stale change event"
            );
            return ApplyOutcome::Stale;
        }

        match event.op {
            Operation::Insert | Operation::Update => {
                self.tombstones.remove(&key);
                self.rows.insert(
                    key.clone(),
                    TableRow {
                        key,
                        data: event.row.clone(),
                        commit_order: event.commit_order,
                    },
                );
            }
            Operation::Delete => {
                self.rows.remove(&key);
                self.tombstones.insert(
                    key,
                    Tombstone {
                        commit_order: event.commit_order,
                        expires_at: Instant::now() + self.tombstone_ttl,
                    },
                );
            }
        }
        ApplyOutcome::Applied
    }

    /// All rows, ordered by key.
    pub fn snapshot(&self) -> Vec<TableRow> {
        self.rows.values().cloned().collect()
    }

    /// Atomically replace the cache with an authoritative snapshot.
    ///
    /// Commit-order bookkeeping resets to the snapshot watermark, and
    /// tombstones are cleared: the snapshot already reflects every change at
    /// or below its watermark.
    pub fn replace_all(&mut self, snapshot: TableSnapshot) {
        self.rows = snapshot
            .rows
            .into_iter()
            .map(|(key, data)| {
                (
                    key.clone(),
                    TableRow {
                        key,
                        data,
                        commit_order: snapshot.watermark,
                    },
                )
            })
            .collect();
        self.tombstones.clear();
        self.watermark = snapshot.watermark;
    }

    /// Apply a local mutation before the server has confirmed it.
    ///
    /// The speculative row keeps the prior commit order (or the watermark
    /// for a new row) so the authoritative event for this very mutation,
    /// carrying a higher order, supersedes it instead of being dropped.
    pub fn apply_speculative(&mut self, change: RowChange) -> Speculation {
        let key = change.key().clone();
        let prior = self.rows.get(&key).cloned();
        let base_order = prior
            .as_ref()
            .map(|row| row.commit_order)
            .unwrap_or(self.watermark);

        match change {
            RowChange::Upsert { key, data } => {
                self.rows.insert(
                    key.clone(),
                    TableRow {
                        key,
                        data,
                        commit_order: base_order,
                    },
                );
            }
            RowChange::Delete { key } => {
                self.rows.remove(&key);
            }
        }

        Speculation {
            key,
            prior,
            base_order,
        }
    }

    /// Undo a speculative apply, restoring the pre-mutation state exactly.
    ///
    /// If an authoritative event for the key landed after the speculation,
    /// that event supersedes both the speculation and its rollback.
    pub fn rollback(&mut self, speculation: Speculation) {
        let superseded = self
            .rows
            .get(&speculation.key)
            .map(|row| row.commit_order > speculation.base_order)
            .unwrap_or_else(|| {
                self.tombstones
                    .get(&speculation.key)
                    .is_some_and(|tomb| tomb.commit_order > speculation.base_order)
            });
        if superseded {
            return;
        }

        match speculation.prior {
            Some(row) => {
                self.rows.insert(speculation.key, row);
            }
            None => {
                self.rows.remove(&speculation.key);
            }
        }
    }

    fn last_seen(&self, key: &RowKey) -> CommitOrder {
        let row_order = self.rows.get(key).map(|row| row.commit_order);
        let tomb_order = self.tombstones.get(key).map(|tomb| tomb.commit_order);
        row_order
            .into_iter()
            .chain(tomb_order)
            .chain(std::iter::once(self.watermark))
            .max()
            .unwrap_or(self.watermark)
    }

    fn prune_tombstones(&mut self) {
        if self.tombstones.is_empty() {
            return;
        }
        let now = Instant::now();
        self.tombstones.retain(|_, tomb| tomb.expires_at > now);
    }
}
