//! Short-lived read-through cache for course metadata.
//!
//! Entries carry their own TTL fixed at insertion and expire lazily: an
//! expired entry is reported as a miss and dropped on the next lookup, so no
//! background sweeper is required. [`EntryCache::purge_expired`] exists for
//! callers that want to bound memory anyway.
//!
//! The cache is never the source of truth. It only holds values that are
//! immutable within their TTL (course definitions, the catalogue); progress
//! records always come from the store or the sync feed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Cached entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

// ---------------------------------------------------------------------------
// Entry cache
// ---------------------------------------------------------------------------

/// Mutex-guarded map with per-entry TTL.
pub struct EntryCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> EntryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. `Some` is a hit; expired entries count as misses
    /// and are evicted.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();

        let value = match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Insert with the cache's default TTL.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.lock().insert(key, entry);
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Return the cached value or run `load`, caching its successful result.
    ///
    /// Concurrent misses for the same key may each run the loader; the last
    /// result wins. Loader errors are returned as-is and nothing is cached.
    pub async fn get_or_load<E, F, Fut>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load().await?;
        self.put(key, value.clone());
        Ok(value)
    }

    /// Evict expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired cache entries");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        // A panic while holding the lock cannot leave the map half-updated,
        // every critical section is a single map operation.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: EntryCache<&str, u32> = EntryCache::new(Duration::from_secs(300));
        cache.put("course", 7);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&"course"), Some(7));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"course"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_is_fixed_per_entry() {
        let cache: EntryCache<&str, u32> = EntryCache::new(Duration::from_secs(300));
        cache.put_with_ttl("short", 1, Duration::from_secs(10));
        cache.put("long", 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(2));
    }

    #[tokio::test]
    async fn test_get_or_load_caches_success_only() {
        let cache: EntryCache<u8, String> = EntryCache::new(Duration::from_secs(60));

        let failed: Result<String, &str> = cache.get_or_load(1, || async { Err("down") }).await;
        assert!(failed.is_err());
        assert_eq!(cache.get(&1), None);

        let loaded: Result<String, &str> =
            cache.get_or_load(1, || async { Ok("fresh".to_string()) }).await;
        assert_eq!(loaded.unwrap(), "fresh");

        let cached: Result<String, &str> =
            cache.get_or_load(1, || async { Ok("reloaded".to_string()) }).await;
        assert_eq!(cached.unwrap(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache: EntryCache<u8, u8> = EntryCache::new(Duration::from_secs(1));
        cache.put(1, 1);
        cache.put_with_ttl(2, 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.purge_expired();
        assert_eq!(cache.stats().entries, 1);
    }
}
