use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aula::live::{
    Controller, FetchError, LiveConfig, MutationOutcome, RowChange, RowSource, TableSnapshot,
    TableSpec,
};
use aula::policy::PermitAll;
use aula::stream::memory::InMemoryChangeFeed;
use aula::stream::{ChangeEvent, ChangeStreamClient, Operation, RowKey};
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Serves queued snapshots in order, then repeats the last one.
struct ScriptedSource {
    snapshots: Mutex<VecDeque<TableSnapshot>>,
    last: Mutex<TableSnapshot>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    fn new(snapshots: Vec<TableSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into()),
            last: Mutex::new(TableSnapshot {
                rows: vec![],
                watermark: 0,
            }),
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RowSource for ScriptedSource {
    async fn fetch(&self, _table: &str, _filter: Option<&str>) -> Result<TableSnapshot, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.snapshots.lock().await;
        match queue.pop_front() {
            Some(snapshot) => {
                *self.last.lock().await = snapshot.clone();
                Ok(snapshot)
            }
            None => Ok(self.last.lock().await.clone()),
        }
    }
}

fn snapshot(rows: Vec<(&str, Value)>, watermark: u64) -> TableSnapshot {
    TableSnapshot {
        rows: rows
            .into_iter()
            .map(|(key, data)| (RowKey::new(key), data))
            .collect(),
        watermark,
    }
}

fn event(op: Operation, table: &str, row: Value, commit_order: u64) -> ChangeEvent {
    let (row, previous_row) = match op {
        Operation::Delete => (Value::Null, Some(row)),
        _ => (row, None),
    };
    ChangeEvent {
        table: table.into(),
        op,
        row,
        previous_row,
        commit_order,
    }
}

struct Harness {
    feed: Arc<InMemoryChangeFeed>,
    source: Arc<ScriptedSource>,
    controller: Controller,
}

async fn harness(snapshots: Vec<TableSnapshot>) -> Harness {
    let feed = Arc::new(InMemoryChangeFeed::new());
    let source = Arc::new(ScriptedSource::new(snapshots));
    let controller = Controller::new(
        Arc::new(ChangeStreamClient::new(feed.clone())),
        source.clone(),
        Arc::new(PermitAll),
        LiveConfig::default(),
    );
    controller
        .subscribe_all(vec![TableSpec::new("enrollments", "id")])
        .await
        .expect("subscribe");
    Harness {
        feed,
        source,
        controller,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn events_converge_into_snapshot_reads() {
    let h = harness(vec![snapshot(vec![("1", json!({"id": 1, "status": "invited"}))], 10)]).await;

    h.feed.publish(event(
        Operation::Update,
        "enrollments",
        json!({"id": 1, "status": "active"}),
        11,
    ));
    h.feed.publish(event(
        Operation::Insert,
        "enrollments",
        json!({"id": 2, "status": "invited"}),
        12,
    ));
    settle().await;

    let rows = h.controller.read("enrollments").expect("read");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].data["status"], "active");
    assert_eq!(rows[1].key, RowKey::new("2"));
}

#[tokio::test]
async fn stale_events_cannot_regress_state() {
    let h = harness(vec![snapshot(vec![("1", json!({"id": 1, "status": "invited"}))], 10)]).await;

    h.feed.publish(event(
        Operation::Update,
        "enrollments",
        json!({"id": 1, "status": "active"}),
        11,
    ));
    settle().await;

    // Commit order 9 predates both the snapshot watermark and the update.
    h.feed.publish(event(
        Operation::Update,
        "enrollments",
        json!({"id": 1, "status": "withdrawn"}),
        9,
    ));
    settle().await;

    let rows = h.controller.read("enrollments").expect("read");
    assert_eq!(rows[0].data["status"], "active");
}

#[tokio::test]
async fn late_insert_cannot_resurrect_a_deleted_row() {
    let h = harness(vec![snapshot(vec![], 0)]).await;

    h.feed.publish(event(
        Operation::Delete,
        "enrollments",
        json!({"id": 5}),
        20,
    ));
    settle().await;
    // The insert committed at 15 but is delivered after the delete at 20.
    h.feed.publish(event(
        Operation::Insert,
        "enrollments",
        json!({"id": 5, "status": "invited"}),
        15,
    ));
    settle().await;

    assert!(h.controller.read("enrollments").expect("read").is_empty());
}

#[tokio::test]
async fn committed_mutation_is_confirmed_by_the_stream() {
    let h = harness(vec![snapshot(vec![("1", json!({"id": 1, "status": "invited"}))], 10)]).await;

    let outcome = h
        .controller
        .mutate_optimistic(
            "enrollments",
            RowChange::Upsert {
                key: RowKey::new("1"),
                data: json!({"id": 1, "status": "active"}),
            },
            || async { Ok::<(), String>(()) },
        )
        .await
        .expect("mutation runs");
    assert_eq!(outcome, MutationOutcome::Committed);

    // The optimistic value is visible before the server round-trips.
    let rows = h.controller.read("enrollments").expect("read");
    assert_eq!(rows[0].data["status"], "active");

    // Authoritative confirmation arrives through the normal event flow.
    h.feed.publish(event(
        Operation::Update,
        "enrollments",
        json!({"id": 1, "status": "active"}),
        11,
    ));
    settle().await;
    let rows = h.controller.read("enrollments").expect("read");
    assert_eq!(rows[0].commit_order, 11);
}

#[tokio::test]
async fn failed_mutation_rolls_back_exactly() {
    let h = harness(vec![snapshot(
        vec![("1", json!({"id": 1, "status": "invited", "note": "keep me"}))],
        10,
    )])
    .await;
    let before = h.controller.read("enrollments").expect("read");

    let outcome = h
        .controller
        .mutate_optimistic(
            "enrollments",
            RowChange::Delete {
                key: RowKey::new("1"),
            },
            || async { Err("permission revoked server-side") },
        )
        .await
        .expect("mutation runs");
    assert_eq!(
        outcome,
        MutationOutcome::RolledBack("permission revoked server-side".into())
    );

    assert_eq!(h.controller.read("enrollments").expect("read"), before);
}

#[tokio::test]
async fn resync_replaces_the_cache_from_the_source() {
    let h = harness(vec![
        snapshot(vec![("1", json!({"id": 1, "status": "invited"}))], 10),
        snapshot(
            vec![
                ("1", json!({"id": 1, "status": "active"})),
                ("2", json!({"id": 2, "status": "invited"})),
            ],
            30,
        ),
    ])
    .await;
    assert_eq!(h.source.fetch_count(), 1);

    h.feed.force_resync("enrollments");
    settle().await;

    assert_eq!(h.source.fetch_count(), 2);
    let rows = h.controller.read("enrollments").expect("read");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].data["status"], "active");
    // Events at or below the new watermark are stale.
    h.feed.publish(event(
        Operation::Update,
        "enrollments",
        json!({"id": 1, "status": "withdrawn"}),
        30,
    ));
    settle().await;
    assert_eq!(
        h.controller.read("enrollments").expect("read")[0].data["status"],
        "active"
    );
}

#[tokio::test]
async fn teardown_stops_all_delivery() {
    let h = harness(vec![snapshot(vec![], 5)]).await;

    h.controller.teardown();
    h.feed.publish(event(
        Operation::Insert,
        "enrollments",
        json!({"id": 1}),
        6,
    ));
    settle().await;

    assert!(h.controller.read("enrollments").is_err());
    // Teardown is idempotent.
    h.controller.teardown();
}
