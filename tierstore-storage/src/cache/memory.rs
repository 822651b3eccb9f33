//! In-process cache tier.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tierstore_core::{CacheError, Clock, SystemClock, TierResult, Timestamp};

use super::traits::{CacheStats, CacheTier};

#[derive(Debug, Clone)]
struct Entry {
    payload: Vec<u8>,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Cache tier held in a `HashMap`, expiring entries against a [`Clock`].
///
/// Expired entries are dropped lazily when read.
#[derive(Clone)]
pub struct InMemoryCacheTier {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    stats: Arc<RwLock<CacheStats>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCacheTier {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheTier {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            clock,
        }
    }

    /// Whether a live entry exists for `key`, without touching statistics.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| entries.get(key).is_some_and(|e| !e.is_expired(now)))
            .unwrap_or(false)
    }

    fn poisoned() -> CacheError {
        CacheError::Backend {
            reason: "cache lock poisoned".to_string(),
        }
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}

#[async_trait]
impl CacheTier for InMemoryCacheTier {
    async fn get(&self, key: &str) -> TierResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                if let Some(dropped) = entries.remove(key) {
                    self.record(|s| {
                        s.misses += 1;
                        s.expirations += 1;
                        s.entry_count = s.entry_count.saturating_sub(1);
                        s.memory_bytes = s.memory_bytes.saturating_sub(dropped.payload.len() as u64);
                    });
                }
                Ok(None)
            }
            Some(entry) => {
                let payload = entry.payload.clone();
                self.record(|s| s.hits += 1);
                Ok(Some(payload))
            }
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> TierResult<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
        };
        let size = payload.len() as u64;
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let previous = entries.insert(
            key.to_string(),
            Entry {
                payload,
                expires_at,
            },
        );
        self.record(|s| {
            match previous {
                Some(old) => {
                    s.memory_bytes = s.memory_bytes.saturating_sub(old.payload.len() as u64)
                }
                None => s.entry_count += 1,
            }
            s.memory_bytes += size;
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        match entries.remove(key) {
            Some(old) => {
                self.record(|s| {
                    s.entry_count = s.entry_count.saturating_sub(1);
                    s.memory_bytes = s.memory_bytes.saturating_sub(old.payload.len() as u64);
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> TierResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}
