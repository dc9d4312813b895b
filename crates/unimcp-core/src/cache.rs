//! Bounded TTL + LRU cache.
//!
//! Eviction policy: entries expire after `ttl`; when the map is full the
//! least-recently-used entry goes first, with access count as the tiebreak
//! (fewer hits evicted first). Sweeps are explicit (callers run
//! [`TtlLruCache::sweep`] on their own cadence), so the cache itself never
//! spawns tasks and stays usable from synchronous code.
//!
//! Locks are short-lived and never held across await points.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache sizing and expiry knobs.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum live entries before LRU eviction kicks in.
    pub max_entries: usize,
    /// Time-to-live for each entry, measured from insertion.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            ttl: Duration::from_secs(300),
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// A thread-safe bounded cache with TTL expiry and LRU eviction.
pub struct TtlLruCache<K, V> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlLruCache<K, V> {
    /// Create a cache with the given config.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a key, bumping recency and access count on hit.
    ///
    /// Expired entries count as misses and are dropped on the spot.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted_at) <= self.config.ttl => {
                entry.last_access = now;
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value, evicting if the cache is at capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            Self::evict_one(&mut entries);
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_access: now,
                access_count: 0,
            },
        );
    }

    /// Get the cached value, or compute and insert it.
    ///
    /// The per-key single-writer guarantee holds at the map level: the
    /// compute closure runs outside the lock, and the first writer wins if
    /// two callers race on the same key.
    pub fn get_or_insert_with(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(&key) {
            return hit;
        }
        let value = compute();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get_mut(&key) {
            existing.last_access = Instant::now();
            existing.access_count += 1;
            return existing.value.clone();
        }
        if entries.len() >= self.config.max_entries {
            Self::evict_one(&mut entries);
        }
        let now = Instant::now();
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                inserted_at: now,
                last_access: now,
                access_count: 0,
            },
        );
        value
    }

    /// Remove a key.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Keep only entries whose key satisfies the predicate.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.lock().retain(|k, _| keep(k));
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let ttl = self.config.ttl;
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        before - entries.len()
    }

    /// Current number of live entries (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn evict_one(entries: &mut HashMap<K, Entry<V>>) {
        // Least recently used; access count breaks ties.
        let victim = entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_access
                    .cmp(&b.last_access)
                    .then(a.access_count.cmp(&b.access_count))
            })
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            entries.remove(&k);
        }
    }
}

/// Spawn a background task sweeping `cache` every `interval`.
///
/// The task holds a weak handle: it exits once every other owner of the
/// cache is gone.
pub fn spawn_sweeper<K, V>(
    cache: &Arc<TtlLruCache<K, V>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let weak = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(cache) => {
                    let removed = cache.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "cache sweep");
                    }
                }
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small(ttl: Duration) -> TtlLruCache<String, u32> {
        TtlLruCache::new(CacheConfig {
            max_entries: 2,
            ttl,
        })
    }

    #[test]
    fn hit_and_miss() {
        let cache = small(Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn lru_eviction_prefers_cold_entries() {
        let cache = small(Duration::from_secs(60));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        // Touch "a" so "b" is the LRU victim.
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.insert("c".into(), 3);
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let cache = small(Duration::from_millis(0));
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn sweep_reports_removed() {
        let cache = small(Duration::from_millis(0));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn get_or_insert_with_computes_once_per_key() {
        let cache = small(Duration::from_secs(60));
        let v = cache.get_or_insert_with("k".into(), || 9);
        assert_eq!(v, 9);
        let v = cache.get_or_insert_with("k".into(), || 10);
        assert_eq!(v, 9);
    }
}
