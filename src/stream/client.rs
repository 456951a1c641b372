//! Change stream client.
//!
//! Bridges a [`ChangeTransport`] to an [`EventSink`], one pump task per
//! subscription. Delivery follows transport order within a table; there is
//! no ordering relation across tables. Unsubscribing flags the handle closed
//! before the pump task is aborted, so from the caller's perspective no
//! delivery happens after `unsubscribe` returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::event::ChangeEvent;

/// What a subscription receives from the transport.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    Event(ChangeEvent),
    /// The transport reconnected (or fell behind) and may have dropped
    /// events; the subscriber must refetch before trusting its cache again.
    Resync,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Server-side realtime feed, modeled as an at-least-once collaborator.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    async fn open(
        &self,
        table: &str,
        filter: Option<&str>,
    ) -> Result<mpsc::Receiver<StreamSignal>, TransportError>;
}

/// Receives pumped signals. Implementations must tolerate duplicate events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ChangeEvent);
    fn resync(&self, table: &str);
}

pub struct ChangeStreamClient {
    transport: Arc<dyn ChangeTransport>,
}

pub struct SubscriptionHandle {
    table: String,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ChangeStreamClient {
    pub fn new(transport: Arc<dyn ChangeTransport>) -> Self {
        Self { transport }
    }

    pub async fn subscribe(
        &self,
        table: &str,
        filter: Option<&str>,
        sink: Arc<dyn EventSink>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut rx = self.transport.open(table, filter).await?;
        let closed = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn({
            let closed = closed.clone();
            let table = table.to_string();
            async move {
                while let Some(signal) = rx.recv().await {
                    // Checked per signal: a handle closed mid-stream stops
                    // delivery even if the abort has not landed yet.
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match signal {
                        StreamSignal::Event(event) => sink.deliver(event),
                        StreamSignal::Resync => sink.resync(&table),
                    }
                }
                debug!(table, "subscription pump finished");
            }
        });

        Ok(SubscriptionHandle {
            table: table.to_string(),
            closed,
            pump,
        })
    }

    /// Stop delivery for this handle. The closed flag is raised before the
    /// pump is aborted, making the cutoff immediate for the caller.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.closed.store(true, Ordering::SeqCst);
        handle.pump.abort();
    }
}
