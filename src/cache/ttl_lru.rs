//! Bounded TTL-LRU map with as-of revalidation
//!
//! The ingest path caches database-assigned identifiers here. An entry is
//! valid relative to the instant the caller asserted it was last seen in the
//! database (for ingest, the oldest timestamp of the batch just persisted),
//! so a cached id can never outlive its row as long as the TTL stays below
//! the retention window.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    validated_at: DateTime<Utc>,
}

/// Thread-safe bounded LRU map whose entries expire `ttl` after their last
/// validation instant
pub struct TtlLru<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlLru<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up a key, treating expired entries as misses
    ///
    /// A stale hit evicts the entry so the next insert repopulates it.
    pub fn try_get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let stale = match entries.get(key) {
            None => return None,
            Some(entry) => {
                let age = Utc::now().signed_duration_since(entry.validated_at);
                if age.to_std().map_or(false, |age| age > self.ttl) {
                    true
                } else {
                    return Some(entry.value.clone());
                }
            }
        };
        if stale {
            entries.pop(key);
        }
        None
    }

    /// Insert or refresh an entry, asserting it was valid as of `as_of`
    ///
    /// Revalidation only ever extends an entry's life: if the existing entry
    /// carries a newer validation instant, that one is kept.
    pub fn add_or_revalidate(&self, key: K, value: V, as_of: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        let validated_at = match entries.peek(&key) {
            Some(existing) if existing.validated_at > as_of => existing.validated_at,
            _ => as_of,
        };
        entries.put(
            key,
            Entry {
                value,
                validated_at,
            },
        );
    }

    /// Current number of entries (valid and expired)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        cache.add_or_revalidate("cpu".to_string(), 7, Utc::now());
        assert_eq!(cache.try_get(&"cpu".to_string()), Some(7));
    }

    #[test]
    fn test_stale_entry_is_a_miss_and_evicted() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        cache.add_or_revalidate("cpu".to_string(), 7, long_ago);

        assert_eq!(cache.try_get(&"cpu".to_string()), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_revalidate_keeps_newer_instant() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        let now = Utc::now();
        cache.add_or_revalidate("cpu".to_string(), 7, now);
        // A batch with an older oldest-timestamp must not shorten the entry's life
        cache.add_or_revalidate("cpu".to_string(), 7, now - chrono::Duration::seconds(120));

        assert_eq!(cache.try_get(&"cpu".to_string()), Some(7));
    }

    #[test]
    fn test_lru_eviction_on_overflow() {
        let cache: TtlLru<i32, i32> = TtlLru::new(2, Duration::from_secs(60));
        let now = Utc::now();
        cache.add_or_revalidate(1, 1, now);
        cache.add_or_revalidate(2, 2, now);
        // Touch 1 so 2 becomes the LRU victim
        assert_eq!(cache.try_get(&1), Some(1));
        cache.add_or_revalidate(3, 3, now);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_get(&2), None);
        assert_eq!(cache.try_get(&1), Some(1));
        assert_eq!(cache.try_get(&3), Some(3));
    }

    #[test]
    fn test_capacity_clamped() {
        let cache: TtlLru<i32, i32> = TtlLru::new(0, Duration::from_secs(1));
        assert_eq!(cache.capacity(), 1);
    }
}
