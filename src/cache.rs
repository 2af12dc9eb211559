//! Cache for public listings using moka.
//!
//! Public pages (events, published content, resources) are read far more
//! often than they change. Each listing service owns a [`ListingCache`]
//! and clears it on every write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;

use crate::error::{Result, SiteError};

const MAX_ENTRIES: u64 = 1_000;

/// Statistics about cache performance.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    /// Cache hit rate (0.0 to 1.0).
    pub hit_rate: f64,
}

#[derive(Default)]
struct StatsTracker {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsTracker {
    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// TTL cache of listing query results keyed by query.
pub struct ListingCache<V> {
    entries: Cache<String, Arc<Vec<V>>>,
    stats: StatsTracker,
}

impl<V: Send + Sync + 'static> ListingCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
            stats: StatsTracker::default(),
        }
    }

    /// Cache-aside lookup.
    ///
    /// Concurrent misses for the same key share one fetch. Failed fetches
    /// are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<Vec<V>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<V>>>,
    {
        self.stats.record(self.entries.contains_key(key));

        self.entries
            .try_get_with(key.to_string(), async move { fetch().await.map(Arc::new) })
            .await
            .map_err(unshare)
    }

    /// Drop every cached listing.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        CacheStats {
            entries: self.entries.entry_count(),
            hits,
            misses,
            hit_rate: StatsTracker::hit_rate(hits, misses),
        }
    }

    /// Apply pending evictions. Only needed to observe entry counts in tests.
    #[cfg(test)]
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }
}

/// Recover an owned error from moka's shared one, keeping infrastructure
/// codes intact.
fn unshare(err: Arc<SiteError>) -> SiteError {
    match Arc::try_unwrap(err) {
        Ok(err) => err,
        Err(shared) => match shared.as_ref() {
            SiteError::DatabaseInitializing => SiteError::DatabaseInitializing,
            SiteError::Database(msg) => SiteError::Database(msg.clone()),
            SiteError::NotFound(what) => SiteError::NotFound(what),
            other => SiteError::Internal(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let cache: ListingCache<u32> = ListingCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = cache
                .get_or_fetch("upcoming", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(*value, vec![1, 2, 3]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let cache: ListingCache<u32> = ListingCache::new(Duration::from_secs(60));
        cache.get_or_fetch("k", || async { Ok(vec![1]) }).await.unwrap();
        cache.invalidate_all();

        let value = cache.get_or_fetch("k", || async { Ok(vec![2]) }).await.unwrap();
        assert_eq!(*value, vec![2]);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: ListingCache<u32> = ListingCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_fetch("k", || async { Err(SiteError::DatabaseInitializing) })
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::DatabaseInitializing));

        let value = cache.get_or_fetch("k", || async { Ok(vec![7]) }).await.unwrap();
        assert_eq!(*value, vec![7]);
        cache.sync().await;
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn shared_errors_keep_codes() {
        let shared = Arc::new(SiteError::Database("gone".to_string()));
        let _other = shared.clone();
        assert_eq!(unshare(shared).code(), "DATABASE_ERROR");
    }
}
