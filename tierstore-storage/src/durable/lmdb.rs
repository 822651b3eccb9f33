//! LMDB-backed durable store.
//!
//! Uses heed with three named databases:
//!
//! - `rows`: encoded [`StorageKey`] to a bincode [`StoredRow`]
//! - `index`: timestamp index entries (see [`super::index`]), empty values
//! - `meta`: the global row version counter
//!
//! LMDB write transactions are not `Send`, so they never span an `.await`.
//! Optimistic transactions read through short read transactions, then apply
//! their buffered writes in one LMDB write transaction that first re-checks
//! every version they observed.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use heed::types::{Bytes, SerdeBincode, Str};
use heed::{Database, Env, RwTxn};
use serde::{Deserialize, Serialize};
use tierstore_core::{IndexedFields, RetryConfig, StorageError, StorageKey, TierResult};

use super::{index, Cursor, DurableStore, Page, RangeQuery, Record, Transaction};
use crate::lmdb::{open_env, LmdbError};

const VERSION_KEY: &str = "row_version";
const EMPTY: &[u8] = &[];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    version: u64,
    indexed: IndexedFields,
    payload: Vec<u8>,
}

impl From<StoredRow> for Record {
    fn from(row: StoredRow) -> Self {
        Record::new(row.payload, row.indexed)
    }
}

#[derive(Clone)]
struct Tables {
    env: Env,
    rows: Database<Bytes, SerdeBincode<StoredRow>>,
    index: Database<Bytes, Bytes>,
    meta: Database<Str, SerdeBincode<u64>>,
}

impl Tables {
    fn read_row(&self, key: &StorageKey) -> Result<Option<StoredRow>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::txn)?;
        self.rows.get(&rtxn, &key.encode()).map_err(LmdbError::txn)
    }

    /// Apply `writes` atomically, first checking that every key in `expected`
    /// still carries the version observed (`None` = absent).
    fn commit(
        &self,
        expected: &HashMap<StorageKey, Option<u64>>,
        writes: Vec<(StorageKey, Option<Record>)>,
    ) -> TierResult<()> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::txn)?;

        for (key, seen) in expected {
            let current = self
                .rows
                .get(&wtxn, &key.encode())
                .map_err(LmdbError::txn)?
                .map(|row| row.version);
            if current != *seen {
                return Err(StorageError::TransactionConflict {
                    key: key.to_string(),
                }
                .into());
            }
        }

        let mut version = self
            .meta
            .get(&wtxn, VERSION_KEY)
            .map_err(LmdbError::txn)?
            .unwrap_or(0);
        for (key, record) in writes {
            version += 1;
            self.apply(&mut wtxn, &key, record, version)?;
        }
        self.meta
            .put(&mut wtxn, VERSION_KEY, &version)
            .map_err(LmdbError::txn)?;

        wtxn.commit().map_err(LmdbError::txn)?;
        Ok(())
    }

    fn apply(
        &self,
        wtxn: &mut RwTxn,
        key: &StorageKey,
        record: Option<Record>,
        version: u64,
    ) -> Result<(), LmdbError> {
        let encoded = key.encode();
        if let Some(old) = self.rows.get(wtxn, &encoded).map_err(LmdbError::txn)? {
            for entry in index::entries_for(key, &old.indexed) {
                self.index.delete(wtxn, &entry).map_err(LmdbError::txn)?;
            }
        }
        match record {
            Some(record) => {
                for entry in index::entries_for(key, &record.indexed) {
                    self.index.put(wtxn, &entry, EMPTY).map_err(LmdbError::txn)?;
                }
                let row = StoredRow {
                    version,
                    indexed: record.indexed,
                    payload: record.payload,
                };
                self.rows.put(wtxn, &encoded, &row).map_err(LmdbError::txn)?;
            }
            None => {
                self.rows.delete(wtxn, &encoded).map_err(LmdbError::txn)?;
            }
        }
        Ok(())
    }
}

/// Durable store persisted in an LMDB environment.
///
/// # Example
///
/// ```ignore
/// let store = LmdbDurableStore::open("/var/lib/tierstore", 1024)?;
/// store.put(&key, record).await?;
/// ```
pub struct LmdbDurableStore {
    tables: Tables,
    retry: RetryConfig,
}

impl LmdbDurableStore {
    /// Open or create a durable store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - A database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        let env = open_env(path, max_size_mb, 3)?;

        let mut wtxn = env.write_txn().map_err(LmdbError::txn)?;
        let rows = env
            .create_database(&mut wtxn, Some("rows"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        let index = env
            .create_database(&mut wtxn, Some("index"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        let meta = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(LmdbError::txn)?;

        Ok(Self {
            tables: Tables {
                env,
                rows,
                index,
                meta,
            },
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl DurableStore for LmdbDurableStore {
    async fn get(&self, key: &StorageKey) -> TierResult<Option<Record>> {
        Ok(self.tables.read_row(key)?.map(Record::from))
    }

    async fn put(&self, key: &StorageKey, record: Record) -> TierResult<()> {
        self.tables
            .commit(&HashMap::new(), vec![(key.clone(), Some(record))])
    }

    async fn put_multi(&self, rows: Vec<(StorageKey, Record)>) -> TierResult<()> {
        let writes = rows.into_iter().map(|(k, r)| (k, Some(r))).collect();
        self.tables.commit(&HashMap::new(), writes)
    }

    async fn delete(&self, key: &StorageKey) -> TierResult<()> {
        self.tables.commit(&HashMap::new(), vec![(key.clone(), None)])
    }

    async fn delete_multi(&self, keys: &[StorageKey]) -> TierResult<()> {
        let writes = keys.iter().map(|k| (k.clone(), None)).collect();
        self.tables.commit(&HashMap::new(), writes)
    }

    async fn begin(&self) -> TierResult<Box<dyn Transaction>> {
        Ok(Box::new(LmdbTransaction {
            tables: self.tables.clone(),
            read_versions: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn range_query(&self, query: &RangeQuery) -> TierResult<Page> {
        let prefix = index::prefix(&query.kind, &query.field);
        let upper = index::upper_bound(&query.kind, &query.field, query.before);
        let lower = match &query.cursor {
            Some(cursor) if cursor.as_bytes() >= upper.as_slice() => return Ok(Page::default()),
            Some(cursor) => Bound::Excluded(cursor.as_bytes()),
            None => Bound::Included(prefix.as_slice()),
        };
        let range = (lower, Bound::Excluded(upper.as_slice()));

        let rtxn = self.tables.env.read_txn().map_err(LmdbError::txn)?;
        let mut page = Page::default();
        let mut last = None;
        for item in self
            .tables
            .index
            .range(&rtxn, &range)
            .map_err(LmdbError::txn)?
            .take(query.limit)
        {
            let (entry, _) = item.map_err(LmdbError::txn)?;
            if let Some(key) = index::key_of(entry, prefix.len()) {
                page.keys.push(key);
            }
            last = Some(entry.to_vec());
        }
        page.cursor = last.map(Cursor::from_bytes);
        Ok(page)
    }

    fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}

struct LmdbTransaction {
    tables: Tables,
    read_versions: HashMap<StorageKey, Option<u64>>,
    writes: BTreeMap<StorageKey, Option<Record>>,
}

#[async_trait]
impl Transaction for LmdbTransaction {
    async fn get(&mut self, key: &StorageKey) -> TierResult<Option<Record>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let row = self.tables.read_row(key)?;
        self.read_versions
            .entry(key.clone())
            .or_insert_with(|| row.as_ref().map(|r| r.version));
        Ok(row.map(Record::from))
    }

    fn put(&mut self, key: StorageKey, record: Record) {
        self.writes.insert(key, Some(record));
    }

    fn delete(&mut self, key: StorageKey) {
        self.writes.insert(key, None);
    }

    async fn commit(self: Box<Self>) -> TierResult<()> {
        let LmdbTransaction {
            tables,
            read_versions,
            writes,
        } = *self;
        tables.commit(&read_versions, writes.into_iter().collect())
    }
}
