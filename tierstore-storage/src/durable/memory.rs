//! In-memory durable store.
//!
//! Rows live in a `BTreeMap` behind a `RwLock`, each carrying a version
//! number bumped on every write. The timestamp index is a `BTreeSet` of
//! encoded entries laid out exactly as in the LMDB store, so both backends
//! page identically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tierstore_core::{RetryConfig, StorageError, StorageKey, TierResult};

use super::{index, Cursor, DurableStore, Page, RangeQuery, Record, Transaction};

#[derive(Debug, Clone)]
struct Row {
    version: u64,
    record: Record,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<StorageKey, Row>,
    index: BTreeSet<Vec<u8>>,
    next_version: u64,
}

impl Inner {
    fn version_of(&self, key: &StorageKey) -> Option<u64> {
        self.rows.get(key).map(|row| row.version)
    }

    /// Apply a write (`Some`) or delete (`None`), keeping the index in step.
    fn apply(&mut self, key: StorageKey, record: Option<Record>) {
        if let Some(old) = self.rows.remove(&key) {
            for entry in index::entries_for(&key, &old.record.indexed) {
                self.index.remove(&entry);
            }
        }
        if let Some(record) = record {
            for entry in index::entries_for(&key, &record.indexed) {
                self.index.insert(entry);
            }
            self.next_version += 1;
            self.rows.insert(
                key,
                Row {
                    version: self.next_version,
                    record,
                },
            );
        }
    }
}

/// Durable store held entirely in process memory.
///
/// Cloning shares the underlying rows.
#[derive(Debug, Clone)]
pub struct InMemoryDurableStore {
    inner: Arc<RwLock<Inner>>,
    retry: RetryConfig,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::with_retry(RetryConfig::default())
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retry,
        }
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every row.
    pub fn clear(&self) -> TierResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        inner.rows.clear();
        inner.index.clear();
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &StorageKey) -> TierResult<Option<Record>> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner.rows.get(key).map(|row| row.record.clone()))
    }

    async fn put(&self, key: &StorageKey, record: Record) -> TierResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        inner.apply(key.clone(), Some(record));
        Ok(())
    }

    async fn put_multi(&self, rows: Vec<(StorageKey, Record)>) -> TierResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        for (key, record) in rows {
            inner.apply(key, Some(record));
        }
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> TierResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        inner.apply(key.clone(), None);
        Ok(())
    }

    async fn delete_multi(&self, keys: &[StorageKey]) -> TierResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        for key in keys {
            inner.apply(key.clone(), None);
        }
        Ok(())
    }

    async fn begin(&self) -> TierResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            read_versions: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn range_query(&self, query: &RangeQuery) -> TierResult<Page> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        let prefix = index::prefix(&query.kind, &query.field);
        let upper = index::upper_bound(&query.kind, &query.field, query.before);
        let lower = match &query.cursor {
            Some(cursor) if cursor.as_bytes() >= upper.as_slice() => return Ok(Page::default()),
            Some(cursor) => Bound::Excluded(cursor.as_bytes().to_vec()),
            None => Bound::Included(prefix.clone()),
        };

        let mut page = Page::default();
        let mut last = None;
        for entry in inner
            .index
            .range((lower, Bound::Excluded(upper)))
            .take(query.limit)
        {
            if let Some(key) = index::key_of(entry, prefix.len()) {
                page.keys.push(key);
            }
            last = Some(entry.clone());
        }
        page.cursor = last.map(Cursor::from_bytes);
        Ok(page)
    }

    fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}

struct InMemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    /// Version observed for each key read; `None` means the key was absent.
    read_versions: HashMap<StorageKey, Option<u64>>,
    /// Buffered writes; `None` is a delete.
    writes: BTreeMap<StorageKey, Option<Record>>,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn get(&mut self, key: &StorageKey) -> TierResult<Option<Record>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        let row = inner.rows.get(key);
        self.read_versions
            .entry(key.clone())
            .or_insert_with(|| row.map(|r| r.version));
        Ok(row.map(|r| r.record.clone()))
    }

    fn put(&mut self, key: StorageKey, record: Record) {
        self.writes.insert(key, Some(record));
    }

    fn delete(&mut self, key: StorageKey) {
        self.writes.insert(key, None);
    }

    async fn commit(self: Box<Self>) -> TierResult<()> {
        let InMemoryTransaction {
            inner,
            read_versions,
            writes,
        } = *self;
        let mut inner = inner.write().map_err(|_| StorageError::LockPoisoned)?;
        for (key, seen) in &read_versions {
            if inner.version_of(key) != *seen {
                return Err(StorageError::TransactionConflict {
                    key: key.to_string(),
                }
                .into());
            }
        }
        for (key, record) in writes {
            inner.apply(key, record);
        }
        Ok(())
    }
}
