//! Cache entry implementation.

use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Approximate per-entry bookkeeping cost charged against the byte budget.
pub const ENTRY_OVERHEAD: usize = 16;

/// A cached value with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    value: V,

    /// When this entry was created.
    created_at: Instant,

    /// Time to live.
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Creates a new cache entry.
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Returns the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry and returns the value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns true if this entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Size estimate used by the cache weigher.
pub trait ByteSize {
    /// Returns the approximate number of bytes this value occupies.
    fn byte_size(&self) -> usize;
}

impl ByteSize for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl<const N: usize> ByteSize for [u8; N] {
    fn byte_size(&self) -> usize {
        N
    }
}

impl<const N: usize> ByteSize for Vec<[u8; N]> {
    fn byte_size(&self) -> usize {
        self.len() * N
    }
}

impl ByteSize for IpAddr {
    fn byte_size(&self) -> usize {
        match self {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }
}
