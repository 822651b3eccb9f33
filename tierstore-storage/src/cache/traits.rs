//! Cache tier trait and statistics.

use std::time::Duration;

use async_trait::async_trait;
use tierstore_core::TierResult;

/// Cache tier trait for pluggable cache implementations.
///
/// The cache is a best-effort accelerator in front of the durable store.
/// Values are opaque payloads keyed by a string, each set with a TTL after
/// which the tier stops returning it. A zero TTL stores without expiration.
///
/// Implementations should be thread-safe and support concurrent access. Any
/// error they return is treated by callers as "cache unavailable", never as
/// a reason to fail a read that can still reach the durable store.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Get a payload, or `None` on a miss (absent or expired).
    async fn get(&self, key: &str) -> TierResult<Option<Vec<u8>>>;

    /// Store a payload for at most `ttl`.
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> TierResult<()>;

    /// Delete a payload. Returns `false` if nothing was stored under `key`,
    /// which callers invalidating an entry treat as success.
    async fn delete(&self, key: &str) -> TierResult<bool>;

    /// Get cache statistics.
    async fn stats(&self) -> TierResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired entries included.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate payload bytes held.
    pub memory_bytes: u64,
    /// Number of entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
