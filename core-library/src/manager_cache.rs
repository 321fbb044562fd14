//! Lazily refreshed snapshot of what each external manager knows.
//!
//! The selector consults this only when the record store has no entry. A
//! refresh failure keeps the previous snapshot (if any) and is logged; a
//! manager being offline never fails a selection.

use crate::models::AssetKind;
use crate::normalize::normalize_title;
use bridge_traits::manager::{ManagedItem, ManagerKind, MediaManagerClient};
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct Snapshot {
    fetched_at: DateTime<Utc>,
    items: Vec<ManagedItem>,
}

pub struct ManagerCache {
    clients: HashMap<ManagerKind, Arc<dyn MediaManagerClient>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    snapshots: RwLock<HashMap<ManagerKind, Snapshot>>,
}

impl ManagerCache {
    pub fn new(
        clients: impl IntoIterator<Item = Arc<dyn MediaManagerClient>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.kind(), c)).collect(),
            clock,
            ttl,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        let age = self.clock.now().signed_duration_since(snapshot.fetched_at);
        age.to_std().map(|age| age < self.ttl).unwrap_or(true)
    }

    /// Finds an item by normalized title and exact year (`None` only matches `None`).
    pub async fn find(&self, kind: AssetKind, title: &str, year: Option<i32>) -> Option<ManagedItem> {
        let manager = kind.manager();
        self.refresh_if_stale(manager).await;

        let wanted = normalize_title(title);
        let snapshots = self.snapshots.read().await;
        snapshots.get(&manager).and_then(|snapshot| {
            snapshot
                .items
                .iter()
                .find(|item| item.year == year && normalize_title(&item.title) == wanted)
                .cloned()
        })
    }

    /// Drops every snapshot so the next lookup refetches.
    pub async fn invalidate(&self) {
        self.snapshots.write().await.clear();
    }

    async fn refresh_if_stale(&self, manager: ManagerKind) {
        let Some(client) = self.clients.get(&manager) else {
            return;
        };

        {
            let snapshots = self.snapshots.read().await;
            if snapshots.get(&manager).map(|s| self.is_fresh(s)).unwrap_or(false) {
                return;
            }
        }

        match client.list_items().await {
            Ok(items) => {
                debug!(manager = %manager, count = items.len(), "Refreshed manager cache");
                self.snapshots.write().await.insert(
                    manager,
                    Snapshot {
                        fetched_at: self.clock.now(),
                        items,
                    },
                );
            }
            Err(e) => {
                warn!(manager = %manager, error = %e, "Manager cache refresh failed, keeping previous snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct CountingSonarr {
        calls: AtomicUsize,
        offline: AtomicBool,
    }

    #[async_trait]
    impl MediaManagerClient for CountingSonarr {
        fn kind(&self) -> ManagerKind {
            ManagerKind::Sonarr
        }

        async fn get_path(&self, _id: &str) -> BridgeResult<String> {
            unreachable!()
        }

        async fn set_path(&self, _id: &str, _path: &str) -> BridgeResult<()> {
            unreachable!()
        }

        async fn lookup(&self, _title: &str, _year: Option<i32>) -> BridgeResult<Option<String>> {
            Ok(None)
        }

        async fn list_items(&self) -> BridgeResult<Vec<ManagedItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("connection refused".into()));
            }
            Ok(vec![ManagedItem {
                external_id: "7".into(),
                title: "Foo".into(),
                year: Some(2019),
                path: "/tv2/Foo (2019)".into(),
                item_count: 10,
            }])
        }
    }

    fn setup() -> (ManagerCache, Arc<CountingSonarr>, Arc<ManualClock>) {
        let sonarr = Arc::new(CountingSonarr {
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let cache = ManagerCache::new(
            [sonarr.clone() as Arc<dyn MediaManagerClient>],
            clock.clone(),
            Duration::from_secs(300),
        );
        (cache, sonarr, clock)
    }

    #[tokio::test]
    async fn test_find_requires_exact_year() {
        let (cache, _, _) = setup();

        assert!(cache.find(AssetKind::Series, "foo", Some(2019)).await.is_some());
        assert!(cache.find(AssetKind::Series, "Foo", None).await.is_none());
        assert!(cache.find(AssetKind::Series, "Foo", Some(2020)).await.is_none());
        assert!(cache.find(AssetKind::Movie, "Foo", Some(2019)).await.is_none());
    }

    #[tokio::test]
    async fn test_ttl_controls_refresh() {
        let (cache, sonarr, clock) = setup();

        cache.find(AssetKind::Series, "Foo", Some(2019)).await;
        cache.find(AssetKind::Series, "Foo", Some(2019)).await;
        assert_eq!(sonarr.calls.load(Ordering::SeqCst), 1);

        clock.advance(301);
        cache.find(AssetKind::Series, "Foo", Some(2019)).await;
        assert_eq!(sonarr.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_snapshot() {
        let (cache, sonarr, clock) = setup();
        cache.find(AssetKind::Series, "Foo", Some(2019)).await;

        sonarr.offline.store(true, Ordering::SeqCst);
        clock.advance(600);

        assert!(cache.find(AssetKind::Series, "Foo", Some(2019)).await.is_some());
        assert_eq!(sonarr.calls.load(Ordering::SeqCst), 2);
    }
}
