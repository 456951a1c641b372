//! In-memory change feed for tests and local development.
//!
//! One broadcast channel per table, created lazily. A subscriber that falls
//! behind the channel capacity is handed a `Resync` signal instead of the
//! dropped events, matching what a real transport does after a reconnect.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::client::{ChangeTransport, StreamSignal, TransportError};
use super::event::ChangeEvent;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "stream::memory";
const DEFAULT_CAPACITY: usize = 256;

pub struct InMemoryChangeFeed {
    channels: RwLock<HashMap<String, broadcast::Sender<StreamSignal>>>,
    capacity: usize,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish an event to its table's channel. Returns the number of
    /// subscribers that received it; zero subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender(&event.table)
            .send(StreamSignal::Event(event))
            .unwrap_or(0)
    }

    /// Force every subscriber of `table` to refetch, as after a reconnect.
    pub fn force_resync(&self, table: &str) {
        let _ = self.sender(table).send(StreamSignal::Resync);
    }

    fn sender(&self, table: &str) -> broadcast::Sender<StreamSignal> {
        if let Some(sender) = rw_read(&self.channels, SOURCE, "sender").get(table) {
            return sender.clone();
        }
        // Re-checked under the write lock: another task may have created the
        // channel between the two acquisitions.
        let mut channels = rw_write(&self.channels, SOURCE, "sender");
        channels
            .entry(table.to_string())
            .or_insert_with(|| {
                debug!(table, "creating in-memory change channel");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeTransport for InMemoryChangeFeed {
    async fn open(
        &self,
        table: &str,
        _filter: Option<&str>,
    ) -> Result<mpsc::Receiver<StreamSignal>, TransportError> {
        let mut rx = self.sender(table).subscribe();
        let (tx, out) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Events were dropped; the subscriber must refetch.
                        if tx.send(StreamSignal::Resync).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::stream::event::Operation;

    fn event(table: &str, commit_order: u64) -> ChangeEvent {
        ChangeEvent {
            table: table.into(),
            op: Operation::Insert,
            row: json!({"id": 1}),
            previous_row: None,
            commit_order,
        }
    }

    #[tokio::test]
    async fn publish_reaches_open_receivers() {
        let feed = InMemoryChangeFeed::new();
        let mut rx = feed.open("courses", None).await.expect("open");

        assert_eq!(feed.publish(event("courses", 1)), 1);
        match rx.recv().await {
            Some(StreamSignal::Event(ev)) => assert_eq!(ev.commit_order, 1),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tables_are_isolated() {
        let feed = InMemoryChangeFeed::new();
        let mut courses = feed.open("courses", None).await.expect("open");
        let _users = feed.open("users", None).await.expect("open");

        assert_eq!(feed.publish(event("users", 1)), 1);
        feed.publish(event("courses", 2));
        match courses.recv().await {
            Some(StreamSignal::Event(ev)) => assert_eq!(ev.table, "courses"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let feed = InMemoryChangeFeed::new();
        assert_eq!(feed.publish(event("courses", 1)), 0);
    }
}
