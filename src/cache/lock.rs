//! Lock acquisition helpers that survive poisoning.
//!
//! A panic while holding a cache lock must not take the whole cache down
//! with it; the guarded data is regenerable, so we log and continue.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                source,
                lock_kind = "rwlock.read",
                "recovered from poisoned lock; guarded state may be stale"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                source,
                lock_kind = "rwlock.write",
                "recovered from poisoned lock; guarded state may be stale"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                source,
                lock_kind = "mutex",
                "recovered from poisoned lock; guarded state may be stale"
            );
            poisoned.into_inner()
        }
    }
}
