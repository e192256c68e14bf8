//! # Sift Cache
//!
//! Capacity-bounded caches used by the reputation and safe-search resolvers.
//!
//! ## Features
//!
//! - Byte-weighted capacity with LRU eviction
//! - Per-entry expiry checked at read time; expired entries are purged, never served
//! - Hit/miss statistics

use moka::policy::EvictionPolicy;
use moka::sync::Cache as MokaCache;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

pub mod entry;

pub use entry::{ByteSize, CacheEntry, ENTRY_OVERHEAD};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total weight in bytes.
    pub max_bytes: u64,

    /// Time to live for inserted entries.
    pub ttl: Duration,
}

impl CacheConfig {
    /// Creates a configuration from a byte budget and a TTL in minutes.
    pub fn from_minutes(max_bytes: u64, minutes: u64) -> Self {
        Self {
            max_bytes,
            ttl: Duration::from_secs(minutes.saturating_mul(60)),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// A byte-bounded LRU cache whose entries expire.
pub struct ExpiringCache<K, V> {
    config: CacheConfig,
    cache: MokaCache<K, CacheEntry<V>>,
    stats: CacheStats,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq + ByteSize + Send + Sync + 'static,
    V: Clone + ByteSize + Send + Sync + 'static,
{
    /// Creates a new cache.
    pub fn new(config: CacheConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(config.max_bytes)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|key: &K, entry: &CacheEntry<V>| {
                let size = key.byte_size() + entry.value().byte_size() + ENTRY_OVERHEAD;
                u32::try_from(size).unwrap_or(u32::MAX)
            })
            .build();

        Self {
            config,
            cache,
            stats: CacheStats::default(),
        }
    }

    /// Looks up a live value.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.cache.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                self.stats.record_hit();
                Some(entry.into_value())
            }
            Some(_) => {
                trace!("Cache entry expired");
                self.cache.invalidate(key);
                self.stats.record_expired();
                self.stats.record_miss();
                None
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Inserts a value with the configured TTL.
    pub fn insert(&self, key: K, value: V) {
        self.cache.insert(key, CacheEntry::new(value, self.config.ttl));
    }

    /// Applies pending evictions and removals.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }

    /// Returns the current total weight in bytes.
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        usize::try_from(self.cache.entry_count()).unwrap_or(usize::MAX)
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookups answered with a live entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing live, expired entries included.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Expired entries purged on read.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Hits over all lookups, or 0 before the first lookup.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
