//! Bounded LRU cache with per-entry TTL and hit accounting.
//!
//! Fronts identity reads and search results in the memory service. The
//! recency core is an [`lru::LruCache`]; this module layers TTL expiry,
//! per-entry hit counts, an eviction hook, and bulk seeding on top of it.
//! Recency is bumped on `set` and, when `update_age_on_get` is enabled, on
//! `get`. Entries older than the TTL are invisible to reads and are
//! reclaimed lazily on access or eagerly via [`MemoryCache::prune`]. All
//! operations are infallible and safe to call from multiple threads.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Called with the evicted key/value when a `set` pushes the cache past
/// capacity. Not called for TTL expiry (see [`MemoryCache::prune`]).
pub type EvictionHook<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

/// Counters reported by [`MemoryCache::stats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_sets: u64,
    pub total_deletes: u64,
}

/// Value plus bookkeeping returned by [`MemoryCache::get_with_metadata`].
#[derive(Debug, Clone)]
pub struct EntryMetadata<V> {
    pub value: V,
    /// Insertion time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Number of `get` hits since insertion or replacement.
    pub hit_count: u64,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    inserted_wall: SystemTime,
    hits: u64,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    total_hits: u64,
    total_misses: u64,
    total_sets: u64,
    total_deletes: u64,
}

pub struct MemoryCache<V> {
    max_size: usize,
    ttl: Duration,
    update_age_on_get: bool,
    on_evict: Option<EvictionHook<V>>,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(max_size: usize, ttl: Duration, update_age_on_get: bool) -> Self {
        let max_size = max_size.max(1);
        let capacity = NonZeroUsize::new(max_size).expect("capacity is at least 1");
        Self {
            max_size,
            ttl,
            update_age_on_get,
            on_evict: None,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                total_hits: 0,
                total_misses: 0,
                total_sets: 0,
                total_deletes: 0,
            }),
        }
    }

    /// Register a hook invoked for every capacity eviction.
    pub fn with_eviction_hook(mut self, hook: EvictionHook<V>) -> Self {
        self.on_evict = Some(hook);
        self
    }

    /// Insert or replace. Resets the entry's hit count and timestamp and
    /// makes it most recently used. Evicts the LRU entry at capacity.
    pub fn set(&self, key: &str, value: V) {
        let evicted = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            let displaced = inner.entries.push(
                key.to_string(),
                Entry {
                    value,
                    inserted: Instant::now(),
                    inserted_wall: SystemTime::now(),
                    hits: 0,
                },
            );
            inner.total_sets += 1;
            // push returns the old value for a replaced key, or the LRU
            // entry it evicted to make room; only the latter is an eviction
            displaced.filter(|(displaced_key, _)| displaced_key.as_str() != key)
        };
        if let Some((evicted_key, evicted_entry)) = evicted {
            debug!(key = %evicted_key, "cache entry evicted");
            if let Some(hook) = &self.on_evict {
                hook(&evicted_key, &evicted_entry.value);
            }
        }
    }

    /// Fetch a live entry, counting a hit and refreshing recency when
    /// `update_age_on_get`. Expired or absent keys count as misses; an
    /// expired entry is reclaimed on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_entry(key).map(|meta| meta.value)
    }

    /// [`get`](Self::get) plus the entry's timestamp and hit count.
    pub fn get_with_metadata(&self, key: &str) -> Option<EntryMetadata<V>> {
        self.get_entry(key)
    }

    fn get_entry(&self, key: &str) -> Option<EntryMetadata<V>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired = match inner.entries.peek(key) {
            Some(entry) => self.is_expired(entry),
            None => {
                inner.total_misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.pop(key);
            inner.total_misses += 1;
            return None;
        }
        let entry = if self.update_age_on_get {
            inner.entries.get_mut(key)
        } else {
            inner.entries.peek_mut(key)
        }
        .expect("entry checked present above");
        entry.hits += 1;
        let meta = EntryMetadata {
            value: entry.value.clone(),
            timestamp_ms: epoch_millis(entry.inserted_wall),
            hit_count: entry.hits,
        };
        inner.total_hits += 1;
        Some(meta)
    }

    /// Read a live value without touching recency, hit counts, or stats.
    pub fn peek(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .peek(key)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.value.clone())
    }

    /// Presence of a live entry. No hit/miss accounting.
    pub fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .peek(key)
            .is_some_and(|entry| !self.is_expired(entry))
    }

    /// Remove an entry. Returns whether one was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let removed = inner.entries.pop(key).is_some();
        if removed {
            inner.total_deletes += 1;
        }
        removed
    }

    /// Drop every entry. Stats counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
    }

    /// Snapshot of live keys.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Snapshot of live values.
    pub fn values(&self) -> Vec<V> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry))
            .map(|(_, entry)| entry.value.clone())
            .collect()
    }

    /// Snapshot of live `(key, value)` pairs.
    pub fn entries(&self) -> Vec<(String, V)> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Milliseconds until the entry expires; 0 when absent or expired.
    pub fn get_remaining_ttl(&self, key: &str) -> u64 {
        let inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.peek(key) {
            Some(entry) => {
                let age = entry.inserted.elapsed();
                self.ttl.saturating_sub(age).as_millis() as u64
            }
            None => 0,
        }
    }

    /// Eagerly drop every expired entry. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        expired.len()
    }

    /// Bulk-seed entries through the normal `set` path.
    pub fn warm_up(&self, entries: Vec<(String, V)>) {
        for (key, value) in entries {
            self.set(&key, value);
        }
    }

    /// Snapshot live entries with their insertion timestamps, suitable for
    /// [`load`](Self::load) into another instance.
    pub fn dump(&self) -> Vec<(String, V, u64)> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    entry.value.clone(),
                    epoch_millis(entry.inserted_wall),
                )
            })
            .collect()
    }

    /// Restore a [`dump`](Self::dump), preserving original timestamps so
    /// already-aged entries keep their remaining TTL.
    pub fn load(&self, dump: Vec<(String, V, u64)>) {
        let now_ms = epoch_millis(SystemTime::now());
        for (key, value, timestamp_ms) in dump {
            let age = Duration::from_millis(now_ms.saturating_sub(timestamp_ms));
            self.set(&key, value);
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            if let Some(entry) = inner.entries.peek_mut(&key) {
                if let Some(inserted) = Instant::now().checked_sub(age) {
                    entry.inserted = inserted;
                }
                entry.inserted_wall = UNIX_EPOCH + Duration::from_millis(timestamp_ms);
            }
        }
    }

    /// The `n` live entries with the highest hit counts, descending.
    pub fn get_top_hit_entries(&self, n: usize) -> Vec<(String, V, u64)> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let mut live: Vec<(String, V, u64)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry))
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.hits))
            .collect();
        live.sort_by(|a, b| b.2.cmp(&a.2));
        live.truncate(n);
        live
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let requests = inner.total_hits + inner.total_misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            inner.total_hits as f64 / requests as f64
        };
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hit_rate,
            total_hits: inner.total_hits,
            total_misses: inner.total_misses,
            total_sets: inner.total_sets,
            total_deletes: inner.total_deletes,
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        entry.inserted.elapsed() > self.ttl
    }
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
