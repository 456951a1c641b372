//! Authoritative row source.
//!
//! Where table snapshots come from when a cache must be (re)built: the
//! query API in production, a stub in tests. Refetches run under a bounded
//! timeout with exponential backoff, and a refetch that ultimately fails
//! leaves the previous snapshot in place.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use super::table::TableSnapshot;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("row source transport failed: {0}")]
    Transport(String),
    #[error("row fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, table: &str, filter: Option<&str>) -> Result<TableSnapshot, FetchError>;
}

/// Retry schedule for snapshot fetches.
#[derive(Debug, Clone)]
pub struct RefetchPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RefetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Fetch a snapshot, retrying per `policy`. Returns the last error when
/// every attempt fails.
pub async fn fetch_with_retry(
    source: &dyn RowSource,
    table: &str,
    filter: Option<&str>,
    policy: &RefetchPolicy,
) -> Result<TableSnapshot, FetchError> {
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut last = FetchError::Transport("no fetch attempts made".into());

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, source.fetch(table, filter)).await {
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(err)) => last = err,
            Err(_) => last = FetchError::Timeout(policy.timeout),
        }
        if attempt < attempts {
            warn!(table, attempt, error = %last, "snapshot fetch failed; backing off");
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakySource {
        failures: AtomicU32,
    }

    #[async_trait]
    impl RowSource for FlakySource {
        async fn fetch(
            &self,
            _table: &str,
            _filter: Option<&str>,
        ) -> Result<TableSnapshot, FetchError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                return Err(FetchError::Transport("connection reset".into()));
            }
            Ok(TableSnapshot {
                rows: vec![],
                watermark: 7,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let source = FlakySource {
            failures: AtomicU32::new(2),
        };
        let snapshot = fetch_with_retry(&source, "courses", None, &RefetchPolicy::default())
            .await
            .expect("succeeds on third attempt");
        assert_eq!(snapshot.watermark, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let source = FlakySource {
            failures: AtomicU32::new(10),
        };
        let policy = RefetchPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let err = fetch_with_retry(&source, "courses", None, &policy)
            .await
            .expect_err("all attempts fail");
        assert!(matches!(err, FetchError::Transport(_)));
    }
}
