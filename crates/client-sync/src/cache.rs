//! Per-instance expiring cache for read-mostly remote resources.
//!
//! ## TTL
//!
//! The TTL is a construction parameter, so each resource class gets its own
//! instance (long-lived lists, per-user lists, metrics). An entry older than
//! the TTL is never returned by [`ExpiringCache::get`]; it stays resident so
//! [`ExpiringCache::lookup`] can hand it out as [`Lookup::Stale`] when a
//! re-fetch fails.
//!
//! ## LRU Eviction
//!
//! Uses `IndexMap` ordered by insertion/access time. On capacity overflow,
//! expired entries go first, then the oldest (front) entries.
//!
//! ## Metrics
//!
//! Lock-free atomic counters; call [`ExpiringCache::metrics`] for a snapshot.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::{Equivalent, IndexMap};
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Result of a [`ExpiringCache::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Fresh(V),
    /// Present but past its TTL. Only usable as a fallback.
    Stale(V),
    Miss,
}

impl<V> Lookup<V> {
    #[must_use]
    pub fn fresh(self) -> Option<V> {
        match self {
            Self::Fresh(v) => Some(v),
            Self::Stale(_) | Self::Miss => None,
        }
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of cache metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found only an expired entry (also counted as misses).
    pub stale: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheMetricsSnapshot {
    /// Hit rate (0.0–1.0). Returns 0.0 if no lookups yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Generic per-key TTL cache with manual invalidation.
pub struct ExpiringCache<K, V> {
    name: &'static str,
    ttl: Duration,
    capacity: usize,
    entries: Mutex<IndexMap<K, CacheEntry<V>>>,
    metrics: CacheMetrics,
}

impl<K, V> std::fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    #[must_use]
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            name,
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
            metrics: CacheMetrics::default(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value or `None`. Never fetches.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.lookup(key).fresh()
    }

    /// Like [`get`](Self::get) but distinguishes an expired entry from a miss.
    pub fn lookup<Q>(&self, key: &Q) -> Lookup<V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        let now = Instant::now();
        let mut map = self.lock();
        let Some(idx) = map.get_index_of(key) else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };
        let entry = &map[idx];
        if !entry.is_fresh(self.ttl, now) {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.stale.fetch_add(1, Ordering::Relaxed);
            return Lookup::Stale(entry.value.clone());
        }
        let value = entry.value.clone();
        let last = map.len() - 1;
        map.move_index(idx, last);
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Lookup::Fresh(value)
    }

    /// Store `value` stamped with the current time, replacing any prior entry.
    pub fn put(&self, key: K, value: V) {
        let now = Instant::now();
        let mut map = self.lock();
        if let Some(idx) = map.get_index_of(&key) {
            map.shift_remove_index(idx);
        } else {
            self.evict_if_full(&mut map, now);
        }
        map.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    /// Returns whether an entry was removed.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        let removed = self.lock().shift_remove(key).is_some();
        if removed {
            self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let mut map = self.lock();
        let count = map.len() as u64;
        map.clear();
        drop(map);
        self.metrics.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, entry| entry.is_fresh(self.ttl, now));
        before - map.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            stale: self.metrics.stale.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }

    fn evict_if_full(&self, map: &mut IndexMap<K, CacheEntry<V>>, now: Instant) {
        if map.len() < self.capacity {
            return;
        }
        let before = map.len();
        // Phase 1: evict expired
        map.retain(|_, entry| entry.is_fresh(self.ttl, now));
        // Phase 2: LRU eviction from the front if still at capacity
        while map.len() >= self.capacity {
            map.shift_remove_index(0);
        }
        let evicted = (before - map.len()) as u64;
        self.metrics.evictions.fetch_add(evicted, Ordering::Relaxed);
        tracing::debug!(cache = self.name, evicted, "cache eviction");
    }
}
