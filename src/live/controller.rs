//! Live table controller.
//!
//! One controller per session scope (a user's open workspace), owning its
//! table caches and stream subscriptions exclusively. Nothing here is a
//! process-wide singleton: construction is by injection, teardown is
//! explicit, and two controllers never share mutable state.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::source::{FetchError, RefetchPolicy, RowSource, fetch_with_retry};
use super::table::{RowChange, Speculation, TableCache, TableRow};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::policy::{AccessPolicy, Action};
use crate::stream::{
    ChangeEvent, ChangeStreamClient, EventSink, SubscriptionHandle, TransportError,
};

const SOURCE: &str = "live::controller";

const METRIC_APPLIED: &str = "aula_live_events_applied_total";
const METRIC_STALE: &str = "aula_live_events_stale_total";
const METRIC_UNKEYED: &str = "aula_live_events_unkeyed_total";
const METRIC_ROLLBACKS: &str = "aula_live_rollbacks_total";

/// Timing knobs for the live pipeline.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub tombstone_ttl: Duration,
    pub refetch: RefetchPolicy,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            tombstone_ttl: Duration::from_secs(60),
            refetch: RefetchPolicy::default(),
        }
    }
}

/// One table (or filtered query) the controller mirrors.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub table: String,
    pub key_field: String,
    pub filter: Option<String>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_field: key_field.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Result of an optimistic mutation, as a value rather than a side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Committed,
    /// The server rejected the mutation; the local cache was restored.
    RolledBack(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("access denied: {action:?} on `{table}`")]
    AccessDenied { action: Action, table: String },
    #[error("table `{0}` is not subscribed")]
    UnknownTable(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("controller has been torn down")]
    TornDown,
}

struct Subscription {
    state: AtomicU8,
}

impl Subscription {
    const PENDING: u8 = 0;
    const ACTIVE: u8 = 1;
    const CLOSED: u8 = 2;

    fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
        }
    }

    fn set(&self, state: SubscriptionState) {
        let raw = match state {
            SubscriptionState::Pending => Self::PENDING,
            SubscriptionState::Active => Self::ACTIVE,
            SubscriptionState::Closed => Self::CLOSED,
        };
        self.state.store(raw, Ordering::SeqCst);
    }

    fn get(&self) -> SubscriptionState {
        match self.state.load(Ordering::SeqCst) {
            Self::ACTIVE => SubscriptionState::Active,
            Self::CLOSED => SubscriptionState::Closed,
            _ => SubscriptionState::Pending,
        }
    }
}

/// Shared interior of the controller: the part the stream pump and the
/// resync worker hold on to.
struct ControllerCore {
    caches: RwLock<HashMap<String, Mutex<TableCache>>>,
    specs: RwLock<HashMap<String, TableSpec>>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    source: Arc<dyn RowSource>,
    policy: Arc<dyn AccessPolicy>,
    refetch: RefetchPolicy,
    tombstone_ttl: Duration,
    resync_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    torn_down: AtomicBool,
}

impl ControllerCore {
    /// Fetch an authoritative snapshot and swap it in. On failure the cache
    /// keeps serving its previous contents.
    async fn refetch_table(&self, table: &str) -> Result<(), FetchError> {
        let filter = {
            let specs = rw_read(&self.specs, SOURCE, "refetch");
            match specs.get(table) {
                Some(spec) => spec.filter.clone(),
                None => return Ok(()),
            }
        };

        let snapshot =
            fetch_with_retry(self.source.as_ref(), table, filter.as_deref(), &self.refetch).await?;

        let caches = rw_read(&self.caches, SOURCE, "refetch");
        if let Some(cache) = caches.get(table) {
            mutex_lock(cache, SOURCE, "refetch").replace_all(snapshot);
            debug!(table, "table cache replaced from snapshot");
        }
        Ok(())
    }
}

impl EventSink for ControllerCore {
    fn deliver(&self, event: ChangeEvent) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let caches = rw_read(&self.caches, SOURCE, "deliver");
        let Some(cache) = caches.get(&event.table) else {
            return;
        };
        use super::table::ApplyOutcome;
        match mutex_lock(cache, SOURCE, "deliver").apply_event(&event) {
            ApplyOutcome::Applied => counter!(METRIC_APPLIED).increment(1),
            ApplyOutcome::Stale => counter!(METRIC_STALE).increment(1),
            ApplyOutcome::Unkeyed => {
                counter!(METRIC_UNKEYED).increment(1);
                warn!(
                    table = event.table,
                    commit_order = event.commit_order,
                    "change event carried no row key"
                );
            }
        }
    }

    fn resync(&self, table: &str) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = mutex_lock(&self.resync_tx, SOURCE, "resync").as_ref() {
            let _ = tx.send(table.to_string());
        }
    }
}

pub struct Controller {
    core: Arc<ControllerCore>,
    stream: Arc<ChangeStreamClient>,
    handles: Mutex<Vec<SubscriptionHandle>>,
    resync_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        stream: Arc<ChangeStreamClient>,
        source: Arc<dyn RowSource>,
        policy: Arc<dyn AccessPolicy>,
        config: LiveConfig,
    ) -> Self {
        Self {
            core: Arc::new(ControllerCore {
                caches: RwLock::new(HashMap::new()),
                specs: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                source,
                policy,
                refetch: config.refetch,
                tombstone_ttl: config.tombstone_ttl,
                resync_tx: Mutex::new(None),
                torn_down: AtomicBool::new(false),
            }),
            stream,
            handles: Mutex::new(Vec::new()),
            resync_worker: Mutex::new(None),
        }
    }

    /// Subscribe to every table in `specs` and load initial snapshots.
    ///
    /// Per table: stream subscription first, then the snapshot fetch, so
    /// changes committed during the fetch are replayed on top of it (or
    /// dropped as stale by the watermark) instead of falling in a gap. A
    /// failed initial fetch is not fatal; the cache starts empty and heals
    /// on the next resync.
    pub async fn subscribe_all(&self, specs: Vec<TableSpec>) -> Result<(), ControllerError> {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return Err(ControllerError::TornDown);
        }
        self.ensure_resync_worker();

        for spec in specs {
            let table = spec.table.clone();
            let filter = spec.filter.clone();
            let subscription = Arc::new(Subscription::new());
            {
                rw_write(&self.core.caches, SOURCE, "subscribe").insert(
                    table.clone(),
                    Mutex::new(TableCache::new(&spec.key_field, self.core.tombstone_ttl)),
                );
                rw_write(&self.core.specs, SOURCE, "subscribe").insert(table.clone(), spec);
                rw_write(&self.core.subscriptions, SOURCE, "subscribe")
                    .insert(table.clone(), subscription.clone());
            }

            let sink: Arc<dyn EventSink> = self.core.clone();
            let handle = self
                .stream
                .subscribe(&table, filter.as_deref(), sink)
                .await?;
            mutex_lock(&self.handles, SOURCE, "subscribe").push(handle);
            subscription.set(SubscriptionState::Active);

            if let Err(err) = self.core.refetch_table(&table).await {
                warn!(
                    table,
                    error = %err,
                    "initial snapshot fetch failed; serving empty cache until resync"
                );
            }
        }
        Ok(())
    }

    /// Snapshot of a table's rows, ordered by key. Returns the last-known
    /// rows even while a refetch is failing.
    pub fn read(&self, table: &str) -> Result<Vec<TableRow>, ControllerError> {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return Err(ControllerError::TornDown);
        }
        if !self.core.policy.allow(Action::Read, table) {
            return Err(ControllerError::AccessDenied {
                action: Action::Read,
                table: table.to_string(),
            });
        }

        let caches = rw_read(&self.core.caches, SOURCE, "read");
        let cache = caches
            .get(table)
            .ok_or_else(|| ControllerError::UnknownTable(table.to_string()))?;
        Ok(mutex_lock(cache, SOURCE, "read").snapshot())
    }

    /// Apply `change` locally, then run `commit` against the server.
    ///
    /// On commit failure the local cache is restored to its pre-mutation
    /// state and the failure is reported as [`MutationOutcome::RolledBack`];
    /// confirmation of a successful commit arrives implicitly through the
    /// change stream.
    pub async fn mutate_optimistic<F, Fut, E>(
        &self,
        table: &str,
        change: RowChange,
        commit: F,
    ) -> Result<MutationOutcome, ControllerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        if self.core.torn_down.load(Ordering::SeqCst) {
            return Err(ControllerError::TornDown);
        }
        if !self.core.policy.allow(Action::Mutate, table) {
            return Err(ControllerError::AccessDenied {
                action: Action::Mutate,
                table: table.to_string(),
            });
        }

        // Cache locks are released before the commit await.
        let speculation: Speculation = {
            let caches = rw_read(&self.core.caches, SOURCE, "mutate");
            let cache = caches
                .get(table)
                .ok_or_else(|| ControllerError::UnknownTable(table.to_string()))?;
            mutex_lock(cache, SOURCE, "mutate").apply_speculative(change)
        };

        match commit().await {
            Ok(()) => Ok(MutationOutcome::Committed),
            Err(err) => {
                counter!(METRIC_ROLLBACKS).increment(1);
                let caches = rw_read(&self.core.caches, SOURCE, "rollback");
                if let Some(cache) = caches.get(table) {
                    mutex_lock(cache, SOURCE, "rollback").rollback(speculation);
                }
                Ok(MutationOutcome::RolledBack(err.to_string()))
            }
        }
    }

    pub fn subscription_state(&self, table: &str) -> Option<SubscriptionState> {
        rw_read(&self.core.subscriptions, SOURCE, "state")
            .get(table)
            .map(|sub| sub.get())
    }

    /// Shut the controller down. Subscriptions are flagged closed before
    /// any transport resource is released, so once this returns no further
    /// delivery is observable. Idempotent.
    pub fn teardown(&self) {
        if self.core.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for subscription in rw_read(&self.core.subscriptions, SOURCE, "teardown").values() {
            subscription.set(SubscriptionState::Closed);
        }
        for handle in mutex_lock(&self.handles, SOURCE, "teardown").drain(..) {
            self.stream.unsubscribe(&handle);
        }
        *mutex_lock(&self.core.resync_tx, SOURCE, "teardown") = None;
        if let Some(worker) = mutex_lock(&self.resync_worker, SOURCE, "teardown").take() {
            worker.abort();
        }
    }

    fn ensure_resync_worker(&self) {
        let mut worker = mutex_lock(&self.resync_worker, SOURCE, "worker");
        if worker.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *mutex_lock(&self.core.resync_tx, SOURCE, "worker") = Some(tx);

        let core = self.core.clone();
        *worker = Some(tokio::spawn(async move {
            while let Some(table) = rx.recv().await {
                if core.torn_down.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = core.refetch_table(&table).await {
                    warn!(table, error = %err, "resync refetch failed; keeping previous snapshot");
                }
            }
        }));
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.teardown();
    }
}
