//! tierstore Test Utilities
//!
//! Shared helpers for tierstore tests:
//! - [`ManualClock`], a clock that only moves when told to
//! - fault-injecting doubles for both storage tiers
//! - proptest generators
//! - entity fixtures exercising every capability
//! - assertions over [`TierResult`]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tierstore_core::{
    CacheError, Clock, RetryConfig, StorageError, StorageKey, TierError, TierResult, Timestamp,
};
use tierstore_storage::{
    CacheStats, CacheTier, DurableStore, InMemoryCacheTier, InMemoryDurableStore, Page,
    RangeQuery, Record, Transaction,
};
use uuid::Uuid;

// ============================================================================
// MANUAL CLOCK
// ============================================================================

/// 2024-01-01T00:00:00Z
const MANUAL_CLOCK_EPOCH_SECS: i64 = 1_704_067_200;

/// A [`Clock`] that stays put until advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(
            chrono::DateTime::from_timestamp(MANUAL_CLOCK_EPOCH_SECS, 0).unwrap_or_else(Utc::now),
        )
    }
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("advance within chrono range");
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn set(&self, to: Timestamp) {
        *self.now.lock().expect("clock lock") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().expect("clock lock")
    }
}

// ============================================================================
// FAULT-INJECTING DOUBLES
// ============================================================================

fn unavailable(op: &str) -> TierError {
    CacheError::Unavailable {
        reason: format!("injected {} failure", op),
    }
    .into()
}

/// In-memory cache tier whose operations can be made to fail on demand.
/// Counts every call, failed or not.
#[derive(Clone, Default)]
pub struct FlakyCache {
    inner: InMemoryCacheTier,
    fail_get: Arc<AtomicBool>,
    fail_set: Arc<AtomicBool>,
    fail_delete: Arc<AtomicBool>,
    gets: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
}

impl FlakyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryCacheTier::with_clock(clock),
            ..Default::default()
        }
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sets(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Fail every operation.
    pub fn go_down(&self) {
        self.fail_gets(true);
        self.fail_sets(true);
        self.fail_deletes(true);
    }

    pub fn recover(&self) {
        self.fail_gets(false);
        self.fail_sets(false);
        self.fail_deletes(false);
    }

    /// The backing cache, bypassing fault injection.
    pub fn inner(&self) -> &InMemoryCacheTier {
        &self.inner
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheTier for FlakyCache {
    async fn get(&self, key: &str) -> TierResult<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(unavailable("get"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> TierResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(unavailable("set"));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(unavailable("delete"));
        }
        self.inner.delete(key).await
    }

    async fn stats(&self) -> TierResult<CacheStats> {
        self.inner.stats().await
    }
}

#[derive(Debug, Default)]
struct Faults {
    conflicts: AtomicU32,
    fail_writes: AtomicBool,
    commits: AtomicU32,
    commit_attempts: AtomicU32,
}

/// In-memory durable store with injectable commit conflicts, commit delay
/// and write failures.
#[derive(Debug, Clone, Default)]
pub struct FaultyDurableStore {
    inner: InMemoryDurableStore,
    faults: Arc<Faults>,
    commit_delay: Duration,
}

impl FaultyDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            inner: InMemoryDurableStore::with_retry(retry),
            ..Default::default()
        }
    }

    /// Sleep for `delay` inside every commit, before anything is applied.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    /// Make the next `count` commits fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.faults.conflicts.store(count, Ordering::SeqCst);
    }

    /// Make non-transactional writes and deletes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Commits that reached the backing store.
    pub fn commits(&self) -> u32 {
        self.faults.commits.load(Ordering::SeqCst)
    }

    /// Commits started, including conflicted and cancelled ones.
    pub fn commit_attempts(&self) -> u32 {
        self.faults.commit_attempts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryDurableStore {
        &self.inner
    }

    fn check_writable(&self) -> TierResult<()> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FaultyDurableStore {
    async fn get(&self, key: &StorageKey) -> TierResult<Option<Record>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &StorageKey, record: Record) -> TierResult<()> {
        self.check_writable()?;
        self.inner.put(key, record).await
    }

    async fn put_multi(&self, rows: Vec<(StorageKey, Record)>) -> TierResult<()> {
        self.check_writable()?;
        self.inner.put_multi(rows).await
    }

    async fn delete(&self, key: &StorageKey) -> TierResult<()> {
        self.check_writable()?;
        self.inner.delete(key).await
    }

    async fn delete_multi(&self, keys: &[StorageKey]) -> TierResult<()> {
        self.check_writable()?;
        self.inner.delete_multi(keys).await
    }

    async fn begin(&self) -> TierResult<Box<dyn Transaction>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            faults: Arc::clone(&self.faults),
            commit_delay: self.commit_delay,
        }))
    }

    async fn range_query(&self, query: &RangeQuery) -> TierResult<Page> {
        self.inner.range_query(query).await
    }

    fn retry_config(&self) -> &RetryConfig {
        self.inner.retry_config()
    }
}

struct FaultyTransaction {
    inner: Box<dyn Transaction>,
    faults: Arc<Faults>,
    commit_delay: Duration,
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn get(&mut self, key: &StorageKey) -> TierResult<Option<Record>> {
        self.inner.get(key).await
    }

    fn put(&mut self, key: StorageKey, record: Record) {
        self.inner.put(key, record);
    }

    fn delete(&mut self, key: StorageKey) {
        self.inner.delete(key);
    }

    async fn commit(self: Box<Self>) -> TierResult<()> {
        self.faults.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        let injected = self
            .faults
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::TransactionConflict {
                key: "injected".to_string(),
            }
            .into());
        }
        self.inner.commit().await?;
        self.faults.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, timestamps and KV rows.

    use super::*;
    use proptest::prelude::*;
    use tierstore_storage::KvRow;

    /// A valid entity kind.
    pub fn arb_kind() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.-]{0,15}"
    }

    /// A non-empty entity id, either free-form or a UUID.
    pub fn arb_id() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9/:_-]{1,24}",
            any::<[u8; 16]>().prop_map(|bytes| Uuid::from_bytes(bytes).to_string()),
        ]
    }

    pub fn arb_storage_key() -> impl Strategy<Value = StorageKey> {
        (arb_kind(), arb_id()).prop_filter_map("valid key", |(kind, id)| {
            StorageKey::new(kind, id).ok()
        })
    }

    /// A microsecond-precision timestamp between 1970 and 2100.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..4_102_444_800_000_000).prop_map(|micros| {
            chrono::DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
        })
    }

    /// A KV row that may or may not carry an expiration.
    pub fn arb_kv_row() -> impl Strategy<Value = KvRow> {
        (
            "[a-z0-9]{1,16}",
            prop::collection::vec(any::<u8>(), 0..64),
            prop::option::of(arb_timestamp()),
        )
            .prop_map(|(key, value, expires)| {
                let row = KvRow::new(key, value);
                match expires {
                    Some(at) => row.with_expires(at),
                    None => row,
                }
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Entity types covering each capability.

    use std::collections::HashMap;
    use std::sync::OnceLock;

    use serde::{Deserialize, Serialize};
    use tierstore_core::{Capabilities, Entity};

    use super::*;

    /// Cacheable counter with no other hooks.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Counter {
        pub id: String,
        pub value: i64,
    }

    impl Counter {
        pub fn new(id: impl Into<String>, value: i64) -> Self {
            Self {
                id: id.into(),
                value,
            }
        }

        /// Only the id set, ready to be read into.
        pub fn shell(id: impl Into<String>) -> Self {
            Self::new(id, 0)
        }
    }

    impl Entity for Counter {
        const CAPABILITIES: Capabilities = Capabilities::CACHEABLE;

        fn kind() -> &'static str {
            "counters"
        }

        fn entity_id(&self) -> String {
            self.id.clone()
        }

        fn cache_ttl(&self, _now: Timestamp) -> Duration {
            Duration::from_secs(60)
        }
    }

    /// Profile with derived fields on both sides of storage.
    ///
    /// `before_write` normalizes the email and bumps the revision;
    /// `after_read` derives the initials, which are never stored.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Profile {
        pub id: String,
        pub display_name: String,
        pub email: String,
        pub revision: u64,
        #[serde(skip)]
        pub initials: String,
    }

    impl Profile {
        pub fn new(id: impl Into<String>, display_name: impl Into<String>, email: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                display_name: display_name.into(),
                email: email.into(),
                ..Default::default()
            }
        }

        pub fn shell(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                ..Default::default()
            }
        }
    }

    impl Entity for Profile {
        const CAPABILITIES: Capabilities = Capabilities::BEFORE_WRITE
            .union(Capabilities::AFTER_READ)
            .union(Capabilities::CACHEABLE);

        fn kind() -> &'static str {
            "profiles"
        }

        fn entity_id(&self) -> String {
            self.id.clone()
        }

        fn before_write(&mut self) {
            self.email = self.email.trim().to_lowercase();
            self.revision += 1;
        }

        fn after_read(&mut self) {
            self.initials = self
                .display_name
                .split_whitespace()
                .filter_map(|word| word.chars().next())
                .flat_map(char::to_uppercase)
                .collect();
        }

        fn cache_ttl(&self, _now: Timestamp) -> Duration {
            Duration::from_secs(300)
        }
    }

    fn reset_counts() -> &'static Mutex<HashMap<String, u32>> {
        static RESETS: OnceLock<Mutex<HashMap<String, u32>>> = OnceLock::new();
        RESETS.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Append-only ledger. Not cacheable.
    ///
    /// `staged` accumulates entries during a mutation and is cleared by
    /// `reset_for_retry`; every reset is counted per ledger id, see
    /// [`Ledger::resets`].
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Ledger {
        pub id: String,
        pub entries: Vec<String>,
        #[serde(skip)]
        pub staged: Vec<String>,
    }

    impl Ledger {
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                ..Default::default()
            }
        }

        /// How many times `reset_for_retry` ran for ledger `id`.
        pub fn resets(id: &str) -> u32 {
            reset_counts()
                .lock()
                .expect("reset counts lock")
                .get(id)
                .copied()
                .unwrap_or(0)
        }

        /// Stage `entry` and append it.
        pub fn record(&mut self, entry: impl Into<String>) {
            let entry = entry.into();
            self.staged.push(entry.clone());
            self.entries.push(entry);
        }
    }

    impl Entity for Ledger {
        const CAPABILITIES: Capabilities = Capabilities::RESET_FOR_RETRY;

        fn kind() -> &'static str {
            "ledgers"
        }

        fn entity_id(&self) -> String {
            self.id.clone()
        }

        fn reset_for_retry(&mut self) {
            self.staged.clear();
            *reset_counts()
                .lock()
                .expect("reset counts lock")
                .entry(self.id.clone())
                .or_insert(0) += 1;
        }
    }

    /// Unique id for tests that share global state.
    pub fn unique_id(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::now_v7())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over [`TierResult`] outcomes.

    use super::*;
    use tierstore_core::Outcome;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TierResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert the error classifies as `expected`.
    #[track_caller]
    pub fn assert_outcome<T: std::fmt::Debug>(result: &TierResult<T>, expected: Outcome) {
        match result {
            Err(e) => assert_eq!(e.outcome(), expected, "Wrong outcome for {:?}", e),
            Ok(value) => panic!("Expected {:?}, got Ok({:?})", expected, value),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TierResult<T>) {
        match result {
            Err(TierError::Storage(StorageError::NotFound { .. })) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert conflict retries ran out.
    #[track_caller]
    pub fn assert_transaction_failed<T: std::fmt::Debug>(result: &TierResult<T>, attempts: u32) {
        match result {
            Err(TierError::Storage(StorageError::TransactionFailed { attempts: got, .. })) => {
                assert_eq!(*got, attempts, "Wrong attempt count");
            }
            other => panic!("Expected TransactionFailed, got: {:?}", other),
        }
    }

    /// Assert the write committed but left `key` possibly stale in the cache.
    #[track_caller]
    pub fn assert_invalidation_failed<T: std::fmt::Debug>(result: &TierResult<T>, key: &str) {
        match result {
            Err(TierError::InvalidationFailed { key: got, .. }) => {
                assert_eq!(got, key, "Wrong cache key");
            }
            other => panic!("Expected InvalidationFailed, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tierstore_core::Entity;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::default();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_flaky_cache_fails_on_demand() {
        let cache = FlakyCache::new();
        cache.set("k:a", b"v".to_vec(), Duration::ZERO).await.expect("set");
        cache.fail_gets(true);
        assert!(matches!(cache.get("k:a").await, Err(TierError::Cache(_))));
        cache.recover();
        assert_eq!(cache.get("k:a").await.expect("get"), Some(b"v".to_vec()));
        assert_eq!(cache.get_calls(), 2);
        assert_eq!(cache.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = FaultyDurableStore::new();
        store.inject_conflicts(1);
        let key = StorageKey::new("counters", "a").expect("key");

        let mut txn = store.begin().await.expect("begin");
        txn.put(key.clone(), Record::default());
        assert!(txn.commit().await.expect_err("conflict").is_conflict());

        let mut txn = store.begin().await.expect("begin");
        txn.put(key.clone(), Record::default());
        txn.commit().await.expect("commit");
        assert_eq!(store.commit_attempts(), 2);
        assert_eq!(store.commits(), 1);
        assert!(store.get(&key).await.expect("get").is_some());
    }

    #[test]
    fn test_profile_hooks() {
        let mut profile = fixtures::Profile::new("p", " grace  Brewster hopper ", " GRACE@Navy.mil ");
        profile.before_write();
        profile.after_read();
        assert_eq!(profile.email, "grace@navy.mil");
        assert_eq!(profile.initials, "GBH");
        assert_eq!(profile.revision, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_keys_roundtrip(key in generators::arb_storage_key()) {
            prop_assert_eq!(StorageKey::decode(&key.encode()), Some(key));
        }

        #[test]
        fn prop_generated_rows_are_valid_entities(row in generators::arb_kv_row()) {
            prop_assert!(row.storage_key().is_ok());
            prop_assert_eq!(row.indexed_fields().is_empty(), row.expires.is_none());
        }
    }
}
