//! Recently-stopped container cache (spec §3, §4.2, §5, §8 property 4).
//!
//! Suppresses duplicate completion notices and "no such container" noise from
//! the controller by remembering, for a configured retention window, which
//! container IDs recently finished.

use crate::model::ContainerId;
use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

struct Inner {
    // Insertion-ordered FIFO of (id, expiry). Since retention is process-wide
    // and fixed, expiry is monotonic in insertion order (spec §3 invariant b).
    order: VecDeque<(ContainerId, i64)>,
    members: HashSet<ContainerId>,
}

/// Insertion-ordered mapping of recently completed container IDs to expiry
/// timestamps. All access is serialized under a single mutex (spec §5).
pub struct RecentlyStoppedCache {
    retention_ms: i64,
    inner: Mutex<Inner>,
}

impl RecentlyStoppedCache {
    pub fn new(retention_ms: i64) -> Self {
        assert!(retention_ms >= 0, "retention must be non-negative");
        Self {
            retention_ms,
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    /// Record that `id` has just completed. A no-op if already present.
    pub async fn remember(&self, id: ContainerId) {
        let mut inner = self.inner.lock().await;
        if inner.members.insert(id.clone()) {
            let expiry = now_ms() + self.retention_ms;
            inner.order.push_back((id, expiry));
        }
    }

    pub async fn contains(&self, id: &ContainerId) -> bool {
        self.inner.lock().await.members.contains(id)
    }

    /// Garbage-collect entries whose expiry has passed. `still_live` decides,
    /// for the oldest still-expired candidate, whether its container is still
    /// present in the live map and its application not yet stopped — in which
    /// case GC must stop there rather than skip ahead (spec §3 invariant b/c).
    pub async fn gc<F>(&self, still_live: F)
    where
        F: Fn(&ContainerId) -> bool,
    {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        loop {
            match inner.order.front() {
                Some((id, expiry)) if *expiry <= now && !still_live(id) => {
                    let (id, _) = inner.order.pop_front().unwrap();
                    inner.members.remove(&id);
                }
                _ => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(seq: u64) -> ContainerId {
        use crate::model::ApplicationId;
        ContainerId {
            application_attempt_id: ApplicationId { cluster_timestamp: 1, id: 1 },
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn remember_then_contains() {
        let cache = RecentlyStoppedCache::new(600_000);
        let id = cid(1);
        assert!(!cache.contains(&id).await);
        cache.remember(id.clone()).await;
        assert!(cache.contains(&id).await);
    }

    #[tokio::test]
    async fn gc_is_noop_before_expiry() {
        let cache = RecentlyStoppedCache::new(600_000);
        cache.remember(cid(1)).await;
        cache.gc(|_| false).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn gc_stops_at_first_still_live_entry() {
        // retention 0 => every entry is immediately expiry-eligible; GC must
        // still stop at the oldest entry that the caller reports as still live.
        let cache = RecentlyStoppedCache::new(0);
        cache.remember(cid(1)).await;
        cache.remember(cid(2)).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let first = cid(1);
        cache.gc(move |id| *id == first).await;

        assert!(cache.contains(&cid(1)).await, "still-live entry must survive GC");
        assert!(cache.contains(&cid(2)).await, "GC must not skip ahead of a live oldest entry");
    }

    #[tokio::test]
    async fn gc_removes_expired_and_not_live() {
        let cache = RecentlyStoppedCache::new(0);
        cache.remember(cid(1)).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        cache.gc(|_| false).await;
        assert!(cache.is_empty().await);
    }
}
