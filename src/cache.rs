//! Owned, bounded TTL caches shared across requests
//!
//! Two shapes are used by the service:
//!
//! - [`TtlCache`]: keyed, capacity-bounded, per-entry TTL. Backs the signing
//!   key cache.
//! - [`SlotCache`]: a single `{value, expiry}` slot whose TTL is decided per
//!   store. Backs the authorization server metadata cache.
//!
//! Both take an explicit `now` in their `*_at` methods so expiry can be
//! exercised without sleeping. Lifetimes are capped at [`MAX_TTL`].
//! Concurrent writers race benignly: the last write wins.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

/// Longest lifetime any entry is granted.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Expiry for an entry stored at `now`, with `ttl` capped at [`MAX_TTL`].
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

/// A cached value with its expiry
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed for expiry or capacity
    pub evictions: u64,
    /// Entries currently held
    pub size: usize,
}

/// Keyed cache with a capacity bound and a fixed TTL per entry.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CachedEntry<V>>,
    capacity: usize,
    ttl: Duration,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries for `ttl` each.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Get a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Get a live entry as of `now`. Expired entries are evicted on access.
    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let Some(entry) = self.entries.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove(key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert an entry.
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    /// Insert an entry as of `now`, evicting expired entries first and then
    /// the oldest entry if the cache is still full.
    pub fn insert_at(&self, key: K, value: V, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_expired(now);
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().inserted_at)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.entries.insert(
            key,
            CachedEntry {
                value,
                inserted_at: now,
                expires_at: expiry(now, self.ttl),
            },
        );
    }

    fn evict_expired(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

/// A single shared `{value, expiry}` slot.
pub struct SlotCache<V> {
    slot: RwLock<Option<(V, Instant)>>,
}

impl<V: Clone> SlotCache<V> {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Get the value if it has not expired as of `now`.
    pub fn get_at(&self, now: Instant) -> Option<V> {
        let slot = self.slot.read();
        match slot.as_ref() {
            Some((value, expires_at)) if now < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    /// Replace the slot, valid for `ttl` from `now`.
    pub fn store_at(&self, value: V, ttl: Duration, now: Instant) {
        *self.slot.write() = Some((value, expiry(now, ttl)));
    }
}

impl<V: Clone> Default for SlotCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
