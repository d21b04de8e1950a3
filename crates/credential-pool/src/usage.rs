//! Usage log writer
//!
//! One entry per logical request per target. Writes go straight to the
//! store and never share a connection or task with the response body, so a
//! client hanging up mid-stream cannot lose the entry.
//!
//! Admission only reads the current quota day and the last minute, so older
//! entries are pruned periodically to keep the log bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::UsageLogEntry;
use crate::notify::{Notifier, StateChange};
use crate::now_millis;
use crate::store::Store;

/// Shortest retention that still covers a whole quota day.
pub const MIN_USAGE_RETENTION: Duration = Duration::from_secs(25 * 3600);

/// How often `spawn_usage_pruning` runs.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct UsageLogger {
    store: Arc<dyn Store>,
    notifier: Notifier,
}

impl UsageLogger {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Append `entry`. Failures are logged, not returned: the request
    /// outcome has already been decided.
    pub async fn record(&self, entry: UsageLogEntry) {
        let change = StateChange::UsageLogged {
            user_id: entry.user_id,
            model: entry.model.clone(),
            status: entry.status,
            category: entry.category,
        };
        let user_id = entry.user_id;
        match self.store.insert_usage(entry).await {
            Ok(_) => self.notifier.notify(change),
            Err(e) => warn!(user_id, error = %e, "failed to write usage log entry"),
        }
    }
}

/// Drop entries older than `retention` (at least `MIN_USAGE_RETENTION`).
pub async fn prune_expired(store: &dyn Store, retention: Duration, now: u64) -> Result<usize> {
    let retention = retention.max(MIN_USAGE_RETENTION);
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    store.prune_usage(now.saturating_sub(retention_ms)).await
}

/// Prune the usage log every `interval`, starting immediately so history
/// loaded from a snapshot is trimmed at startup.
pub fn spawn_usage_pruning(
    store: Arc<dyn Store>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match prune_expired(store.as_ref(), retention, now_millis()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "pruned expired usage entries"),
                Err(e) => warn!(error = %e, "usage pruning failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::ModelGroup;
    use crate::store::UsageQuery;

    const HOUR_MS: u64 = 3_600_000;
    const NOW: u64 = 1_700_000_000_000;

    fn entry(user_id: u64, created_at: u64) -> UsageLogEntry {
        UsageLogEntry {
            id: 0,
            user_id,
            credential_id: None,
            model: "gemini-2.5-flash".into(),
            group: ModelGroup::Flash,
            target: "primary".into(),
            status: 200,
            success: true,
            latency_ms: 3,
            attempts: 1,
            category: None,
            error_code: None,
            error_message: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn pruning_keeps_the_retention_window() {
        let store = MemoryStore::new();
        store.insert_usage(entry(1, NOW - 72 * HOUR_MS)).await.unwrap();
        store.insert_usage(entry(1, NOW - 47 * HOUR_MS)).await.unwrap();
        store.insert_usage(entry(1, NOW - 60_000)).await.unwrap();
        store.insert_usage(entry(2, NOW - 49 * HOUR_MS)).await.unwrap();

        let removed = prune_expired(&store, Duration::from_secs(48 * 3600), NOW)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_usage(UsageQuery::new(1, 0)).await.unwrap(), 2);
        assert_eq!(store.count_usage(UsageQuery::new(2, 0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn short_retention_never_cuts_into_the_quota_day() {
        let store = MemoryStore::new();
        store.insert_usage(entry(1, NOW - 24 * HOUR_MS)).await.unwrap();
        store.insert_usage(entry(1, NOW - 26 * HOUR_MS)).await.unwrap();

        let removed = prune_expired(&store, Duration::from_secs(60), NOW).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_usage(UsageQuery::new(1, 0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pruning_task_runs_at_startup() {
        let store = Arc::new(MemoryStore::new());
        store.insert_usage(entry(1, 1)).await.unwrap();
        store.insert_usage(entry(1, now_millis())).await.unwrap();

        let handle = spawn_usage_pruning(store.clone(), MIN_USAGE_RETENTION, PRUNE_INTERVAL);
        let pruned = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.count_usage(UsageQuery::new(1, 0)).await.unwrap() == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.abort();
        assert!(pruned.is_ok(), "expired entry was not pruned");
    }

    #[tokio::test]
    async fn record_inserts_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let logger = UsageLogger::new(store.clone(), notifier);

        logger
            .record(UsageLogEntry {
                id: 0,
                user_id: 3,
                credential_id: Some(1),
                model: "gemini-2.5-pro".into(),
                group: ModelGroup::Pro,
                target: "primary".into(),
                status: 200,
                success: true,
                latency_ms: 12,
                attempts: 1,
                category: None,
                error_code: None,
                error_message: None,
                created_at: 1,
            })
            .await;

        assert_eq!(store.count_usage(UsageQuery::new(3, 0)).await.unwrap(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            StateChange::UsageLogged { user_id: 3, status: 200, .. }
        ));
    }
}
