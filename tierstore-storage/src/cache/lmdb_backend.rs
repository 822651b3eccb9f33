//! LMDB-backed cache tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! cache that survives process restarts.
//!
//! # Value Format
//!
//! `[expires_at_ms: 8 bytes LE][payload]`, where `expires_at_ms == 0` means
//! the entry never expires. Expired entries are treated as misses and
//! removed on the next read.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get`
//! - Write transactions for `set`, `delete` and expiry cleanup
//! - Statistics are tracked behind a `RwLock`

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env};
use tierstore_core::{Clock, SystemClock, TierError, TierResult};
use tracing::debug;

use super::traits::{CacheStats, CacheTier};
use crate::lmdb::{open_env, LmdbError};

const HEADER_LEN: usize = 8;

fn cache_err(e: LmdbError) -> TierError {
    e.into_cache_error().into()
}

/// LMDB-backed cache tier.
///
/// # Example
///
/// ```ignore
/// use tierstore_storage::cache::{CacheTier, LmdbCacheTier};
///
/// let cache = LmdbCacheTier::open("/tmp/cache", 100)?;
/// cache.set("kvs:a", payload, Duration::from_secs(60)).await?;
/// let hit = cache.get("kvs:a").await?;
/// ```
pub struct LmdbCacheTier {
    /// The LMDB environment.
    env: Env,
    /// The single unnamed database.
    db: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
    /// Global statistics.
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbCacheTier {
    /// Create a new LMDB cache tier.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        let env = open_env(path, max_size_mb, 1)?;

        let mut wtxn = env.write_txn().map_err(LmdbError::txn)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(LmdbError::txn)?;

        Ok(Self {
            env,
            db,
            clock: Arc::new(SystemClock),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    fn remove_key(&self, key: &[u8]) -> Result<Option<usize>, LmdbError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;
        let size = self
            .db
            .get(&wtxn, key)
            .map_err(LmdbError::txn)?
            .map(|bytes| bytes.len().saturating_sub(HEADER_LEN));
        if size.is_some() {
            self.db.delete(&mut wtxn, key).map_err(LmdbError::txn)?;
        }
        wtxn.commit().map_err(LmdbError::txn)?;
        Ok(size)
    }
}

#[async_trait]
impl CacheTier for LmdbCacheTier {
    async fn get(&self, key: &str) -> TierResult<Option<Vec<u8>>> {
        let now_ms = self.clock.now().timestamp_millis();
        let found = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| cache_err(LmdbError::txn(e)))?;
            self.db
                .get(&rtxn, key.as_bytes())
                .map_err(|e| cache_err(LmdbError::txn(e)))?
                .map(|bytes| bytes.to_vec())
        };

        let Some(bytes) = found else {
            self.record(|s| s.misses += 1);
            return Ok(None);
        };

        let expires_at_ms = bytes
            .get(..HEADER_LEN)
            .and_then(|header| <[u8; HEADER_LEN]>::try_from(header).ok())
            .map(i64::from_le_bytes);
        match expires_at_ms {
            Some(at) if at == 0 || at > now_ms => {
                self.record(|s| s.hits += 1);
                Ok(Some(bytes[HEADER_LEN..].to_vec()))
            }
            // Expired or truncated: both are misses.
            _ => {
                let removed = self.remove_key(key.as_bytes()).map_err(cache_err)?;
                debug!(key, removed = removed.is_some(), "Dropped expired cache entry");
                self.record(|s| {
                    s.misses += 1;
                    if let Some(size) = removed {
                        s.expirations += 1;
                        s.entry_count = s.entry_count.saturating_sub(1);
                        s.memory_bytes = s.memory_bytes.saturating_sub(size as u64);
                    }
                });
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> TierResult<()> {
        let expires_at_ms = if ttl.is_zero() {
            0
        } else {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            self.clock
                .now()
                .timestamp_millis()
                .saturating_add(ttl_ms.max(1))
        };

        let mut full_bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        full_bytes.extend_from_slice(&expires_at_ms.to_le_bytes());
        full_bytes.extend_from_slice(&payload);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| cache_err(LmdbError::txn(e)))?;
        let previous = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| cache_err(LmdbError::txn(e)))?
            .map(|bytes| bytes.len().saturating_sub(HEADER_LEN));
        self.db
            .put(&mut wtxn, key.as_bytes(), &full_bytes)
            .map_err(|e| cache_err(LmdbError::txn(e)))?;
        wtxn.commit().map_err(|e| cache_err(LmdbError::txn(e)))?;

        self.record(|s| {
            match previous {
                Some(old) => s.memory_bytes = s.memory_bytes.saturating_sub(old as u64),
                None => s.entry_count += 1,
            }
            s.memory_bytes += payload.len() as u64;
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        let removed = self.remove_key(key.as_bytes()).map_err(cache_err)?;
        if let Some(size) = removed {
            self.record(|s| {
                s.entry_count = s.entry_count.saturating_sub(1);
                s.memory_bytes = s.memory_bytes.saturating_sub(size as u64);
            });
        }
        Ok(removed.is_some())
    }

    async fn stats(&self) -> TierResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}
