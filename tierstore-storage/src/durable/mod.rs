//! Durable store abstraction.
//!
//! The durable tier is the source of truth. It offers keyed reads and writes,
//! batch variants, optimistic transactions with automatic conflict retry, and
//! ordered range queries over per-kind timestamp indexes.
//!
//! # Transactions
//!
//! A [`Transaction`] buffers writes and remembers the version of every key it
//! read. [`Transaction::commit`] applies the buffered writes atomically, or
//! fails with [`StorageError::TransactionConflict`] if any key it read was
//! changed by another commit in the meantime. Dropping a transaction without
//! committing discards it.
//!
//! [`DurableStore::run_transaction`] drives a [`TransactionBody`] through that
//! cycle, re-running the whole body on conflict according to the store's
//! [`RetryConfig`].

pub mod index;
pub mod lmdb;
pub mod memory;

use async_trait::async_trait;
use tierstore_core::{IndexedFields, RetryConfig, StorageError, StorageKey, TierResult, Timestamp};
use tracing::{debug, warn};

pub use lmdb::LmdbDurableStore;
pub use memory::InMemoryDurableStore;

/// A stored row: the opaque entity payload plus the timestamps indexed for it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub payload: Vec<u8>,
    pub indexed: IndexedFields,
}

impl Record {
    pub fn new(payload: Vec<u8>, indexed: IndexedFields) -> Self {
        Self { payload, indexed }
    }
}

/// Opaque resumption point for [`DurableStore::range_query`].
///
/// A cursor stays valid when the row it was taken from is deleted; the next
/// page starts strictly after that position either way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Keys of `kind` whose indexed `field` is strictly before `before`, in
/// ascending `field` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub kind: String,
    pub field: String,
    pub before: Timestamp,
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

impl RangeQuery {
    pub fn new(kind: impl Into<String>, field: impl Into<String>, before: Timestamp, limit: usize) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            before,
            limit,
            cursor: None,
        }
    }

    pub fn after(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of range query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub keys: Vec<StorageKey>,
    /// Position of the last returned key; `None` when the page is empty.
    pub cursor: Option<Cursor>,
}

/// A single optimistic transaction attempt.
#[async_trait]
pub trait Transaction: Send {
    /// Read a row, seeing this transaction's own buffered writes.
    async fn get(&mut self, key: &StorageKey) -> TierResult<Option<Record>>;

    /// Buffer a write.
    fn put(&mut self, key: StorageKey, record: Record);

    /// Buffer a delete.
    fn delete(&mut self, key: StorageKey);

    /// Apply the buffered writes atomically.
    async fn commit(self: Box<Self>) -> TierResult<()>;
}

/// Work executed inside [`DurableStore::run_transaction`].
///
/// `run` may be called several times, once per attempt, each time against a
/// fresh transaction. Any error it returns aborts the transaction without
/// retry and is handed back to the caller unchanged.
#[async_trait]
pub trait TransactionBody: Send {
    async fn run(&mut self, txn: &mut dyn Transaction) -> TierResult<()>;
}

/// The durable tier.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &StorageKey) -> TierResult<Option<Record>>;

    async fn put(&self, key: &StorageKey, record: Record) -> TierResult<()>;

    /// Write several rows in one atomic batch.
    async fn put_multi(&self, rows: Vec<(StorageKey, Record)>) -> TierResult<()>;

    /// Delete a row. Deleting an absent key succeeds.
    async fn delete(&self, key: &StorageKey) -> TierResult<()>;

    /// Delete several rows in one atomic batch.
    async fn delete_multi(&self, keys: &[StorageKey]) -> TierResult<()>;

    /// Start a transaction attempt.
    async fn begin(&self) -> TierResult<Box<dyn Transaction>>;

    /// Ordered keys-only scan over an indexed timestamp field.
    async fn range_query(&self, query: &RangeQuery) -> TierResult<Page>;

    /// Conflict retry policy used by [`DurableStore::run_transaction`].
    fn retry_config(&self) -> &RetryConfig;

    /// Run `body` in a transaction, retrying on commit conflicts.
    ///
    /// Returns the number of attempts it took to commit.
    async fn run_transaction(&self, body: &mut dyn TransactionBody) -> TierResult<u32> {
        let retry = self.retry_config().clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut txn = self.begin().await?;
            body.run(txn.as_mut()).await?;

            match txn.commit().await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Transaction committed after retry");
                    }
                    return Ok(attempt);
                }
                Err(e) if e.is_conflict() => {
                    if attempt >= retry.max_attempts {
                        warn!(attempts = attempt, error = %e, "Transaction retries exhausted");
                        return Err(StorageError::TransactionFailed {
                            attempts: attempt,
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    let backoff = retry.backoff_for(attempt);
                    debug!(attempt, ?backoff, error = %e, "Transaction conflict, retrying");
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(id: &str) -> StorageKey {
        StorageKey::new("counters", id).expect("valid key")
    }

    /// Reads a counter, yields, then writes it back incremented.
    struct Increment {
        key: StorageKey,
        runs: u32,
    }

    #[async_trait]
    impl TransactionBody for Increment {
        async fn run(&mut self, txn: &mut dyn Transaction) -> TierResult<()> {
            self.runs += 1;
            let current = match txn.get(&self.key).await? {
                Some(record) => String::from_utf8_lossy(&record.payload).parse::<i64>().unwrap_or(0),
                None => 0,
            };
            tokio::task::yield_now().await;
            txn.put(
                self.key.clone(),
                Record::new((current + 1).to_string().into_bytes(), IndexedFields::new()),
            );
            Ok(())
        }
    }

    struct Reject;

    #[async_trait]
    impl TransactionBody for Reject {
        async fn run(&mut self, txn: &mut dyn Transaction) -> TierResult<()> {
            txn.put(key("r"), Record::default());
            Err(tierstore_core::TierError::rejected("nope"))
        }
    }

    #[tokio::test]
    async fn test_body_error_aborts_without_commit() {
        let store = InMemoryDurableStore::new();
        let err = store.run_transaction(&mut Reject).await.expect_err("rejected");
        assert_eq!(err.outcome(), tierstore_core::Outcome::Rejected);
        assert!(store.get(&key("r")).await.expect("get").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_all_land() {
        let store = Arc::new(InMemoryDurableStore::with_retry(RetryConfig::immediate(50)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut body = Increment { key: key("c"), runs: 0 };
                store.run_transaction(&mut body).await.expect("commit");
                body.runs
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join") >= 1);
        }
        let record = store.get(&key("c")).await.expect("get").expect("present");
        assert_eq!(record.payload, b"8".to_vec());
    }

    #[test]
    fn test_range_query_builder() {
        let now = chrono::Utc::now();
        let query = RangeQuery::new("kvs", "expires", now, 10).after(Some(Cursor::from_bytes(vec![1])));
        assert_eq!(query.limit, 10);
        assert_eq!(query.cursor.as_ref().map(Cursor::as_bytes), Some(&[1u8][..]));
    }
}
