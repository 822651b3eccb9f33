//! Cache-coherent entity store.
//!
//! Coordinates a [`DurableStore`] (source of truth) and a [`CacheTier`]
//! (best-effort accelerator) so that a successful write is never followed by
//! a read that observes the pre-write state through the cache.
//!
//! Writers invalidate after the durable commit; only readers populate the
//! cache, and only from what they just read from the durable store. Every
//! cache failure on the read path degrades to a durable read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tierstore_core::{
    decode_onto, encode, CacheError, Capabilities, Clock, Entity, EntityDescriptor, StorageError,
    StorageKey, StoreConfig, SystemClock, TierError, TierResult,
};
use tracing::{debug, warn};

use crate::advisory::run_advisory;
use crate::cache::CacheTier;
use crate::durable::{DurableStore, Record, Transaction, TransactionBody};

/// Where a successful read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Durable,
}

/// Result of a committed [`EntityStore::modify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyReport {
    /// Transaction attempts, including the one that committed.
    pub attempts: u32,
}

/// Result of [`EntityStore::write_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteReport {
    /// Entities durably written.
    pub written: usize,
    /// Cache keys whose invalidation failed. These may serve the previous
    /// state until their TTL runs out.
    pub invalidation_failures: Vec<String>,
}

impl BatchWriteReport {
    pub fn is_coherent(&self) -> bool {
        self.invalidation_failures.is_empty()
    }
}

/// Entity store over a durable tier `D` and a cache tier `C`.
pub struct EntityStore<D: ?Sized, C: ?Sized> {
    durable: Arc<D>,
    cache: Arc<C>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl<D: ?Sized, C: ?Sized> Clone for EntityStore<D, C> {
    fn clone(&self) -> Self {
        Self {
            durable: Arc::clone(&self.durable),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<D, C> EntityStore<D, C>
where
    D: DurableStore + ?Sized,
    C: CacheTier + ?Sized,
{
    pub fn new(durable: Arc<D>, cache: Arc<C>, config: StoreConfig) -> Self {
        Self {
            durable,
            cache,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use `clock` for cache TTL computation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn cache_ttl<T: Entity>(&self, descriptor: &EntityDescriptor, entity: &T) -> Duration {
        self.config
            .effective_cache_ttl(descriptor.cache_ttl(entity, self.clock.now()))
    }

    /// Drop the cache entry for `key` if the type is cacheable. An absent
    /// entry counts as success.
    async fn invalidate(
        &self,
        descriptor: &EntityDescriptor,
        key: &StorageKey,
    ) -> Result<(), CacheError> {
        if !descriptor.has(Capabilities::CACHEABLE) {
            return Ok(());
        }
        match self.cache.delete(&key.cache_key()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into_cache_error()),
        }
    }

    fn invalidation_failed(key: &StorageKey, source: CacheError) -> TierError {
        warn!(key = %key.cache_key(), error = %source, "Cache invalidation failed after commit");
        TierError::InvalidationFailed {
            key: key.cache_key(),
            source,
        }
    }

    /// Load the entity identified by `entity`'s id into `entity`.
    ///
    /// Only the id needs to be set on the way in. Serves from the cache when
    /// the type is cacheable and the entry is present and decodable,
    /// otherwise from the durable store, repopulating the cache afterwards.
    /// Stored fields the type no longer declares are ignored, and declared
    /// fields the row lacks keep the value `entity` had on the way in.
    ///
    /// # Errors
    ///
    /// `NotFound` if the durable store has no row for the key.
    pub async fn read<T: Entity>(&self, entity: &mut T) -> TierResult<ReadSource> {
        let descriptor = EntityDescriptor::of::<T>()?;
        let key = entity.storage_key()?;
        let cache_key = key.cache_key();
        let cacheable = !self.cache_ttl(&descriptor, entity).is_zero();

        if cacheable {
            match self.cache.get(&cache_key).await {
                Ok(Some(bytes)) => match decode_onto(descriptor.kind, &bytes, entity) {
                    Ok(decoded) => {
                        *entity = decoded.into_value();
                        descriptor.after_read(entity);
                        debug!(key = %cache_key, "Cache hit");
                        return Ok(ReadSource::Cache);
                    }
                    Err(e) => {
                        debug!(key = %cache_key, error = %e, "Discarding undecodable cache entry");
                        run_advisory("discard", &cache_key, async {
                            self.cache.delete(&cache_key).await.map(|_| ())
                        })
                        .await;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %cache_key, error = %e, "Cache unavailable, reading durable store");
                }
            }
        }

        let record = self
            .durable
            .get(&key)
            .await?
            .ok_or_else(|| TierError::not_found(key.kind(), key.id()))?;
        load_into(&descriptor, &key, entity, &record.payload)?;
        descriptor.after_read(entity);

        if cacheable {
            let ttl = self.cache_ttl(&descriptor, entity);
            if !ttl.is_zero() {
                run_advisory(
                    "populate",
                    &cache_key,
                    self.cache.set(&cache_key, record.payload, ttl),
                )
                .await;
            }
        }
        Ok(ReadSource::Durable)
    }

    /// Persist `entity` and invalidate its cache entry.
    ///
    /// # Errors
    ///
    /// `InvalidationFailed` when the durable write committed but the cache
    /// entry could not be dropped. Readers may see the previous state until
    /// the entry's TTL runs out.
    pub async fn write<T: Entity>(&self, entity: &mut T) -> TierResult<()> {
        let descriptor = EntityDescriptor::of::<T>()?;
        descriptor.before_write(entity);
        let key = entity.storage_key()?;
        let record = Record::new(encode(descriptor.kind, entity)?, entity.indexed_fields());

        self.durable.put(&key, record).await?;
        debug!(key = %key, "Wrote entity");

        self.invalidate(&descriptor, &key)
            .await
            .map_err(|source| Self::invalidation_failed(&key, source))
    }

    /// Invalidate the cache entry, then delete the durable row. Deleting an
    /// absent row succeeds.
    ///
    /// # Errors
    ///
    /// If both tiers fail, the cache error is the one reported.
    pub async fn delete<T: Entity>(&self, entity: &T) -> TierResult<()> {
        let descriptor = EntityDescriptor::of::<T>()?;
        let key = entity.storage_key()?;

        let invalidated = self.invalidate(&descriptor, &key).await;
        let deleted = self.durable.delete(&key).await;

        match (invalidated, deleted) {
            (Ok(()), Ok(())) => {
                debug!(key = %key, "Deleted entity");
                Ok(())
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(source), Ok(())) => Err(Self::invalidation_failed(&key, source)),
            (Err(source), Err(durable)) => {
                warn!(key = %key, error = %durable, "Durable delete also failed");
                Err(TierError::Cache(source))
            }
        }
    }

    /// Load, mutate and save `entity` atomically.
    ///
    /// Each attempt resets the entity (when the type asks for it), reloads
    /// the current durable state into it, runs `mutate`, and writes it back
    /// within one optimistic transaction. Conflicting attempts are retried
    /// from scratch, so `mutate` may run more than once and must tolerate
    /// that. On success `entity` holds the committed state.
    ///
    /// The cache entry is invalidated once, after commit. Between the commit
    /// and that invalidation a concurrent reader may still be served the
    /// previous state from the cache; nothing can observe the previous state
    /// once `modify` has returned. Dropping the returned future before commit
    /// leaves the durable row untouched and invalidates nothing.
    ///
    /// # Errors
    ///
    /// - Any error from `mutate`, returned as-is without committing
    /// - `NotFound` if the row does not exist
    /// - `TransactionFailed` once conflict retries are exhausted
    /// - `InvalidationFailed` when the commit succeeded but the cache could
    ///   not be invalidated
    pub async fn modify<T, F>(&self, entity: &mut T, mutate: F) -> TierResult<ModifyReport>
    where
        T: Entity,
        F: FnMut(&mut T) -> TierResult<()> + Send,
    {
        let descriptor = EntityDescriptor::of::<T>()?;
        let key = entity.storage_key()?;

        let mut body = ModifyBody {
            descriptor,
            key: key.clone(),
            entity,
            mutate,
        };
        let attempts = self.durable.run_transaction(&mut body).await?;
        debug!(key = %key, attempts, "Modified entity");

        self.invalidate(&descriptor, &key)
            .await
            .map_err(|source| Self::invalidation_failed(&key, source))?;
        Ok(ModifyReport { attempts })
    }

    /// Persist several entities of one type in a single durable batch, then
    /// invalidate each of their cache entries.
    ///
    /// Invalidation failures do not fail the batch; they are listed in the
    /// report.
    pub async fn write_batch<T: Entity>(&self, entities: &mut [T]) -> TierResult<BatchWriteReport> {
        if entities.is_empty() {
            return Ok(BatchWriteReport::default());
        }
        let descriptor = EntityDescriptor::of::<T>()?;

        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            descriptor.before_write(entity);
            let key = entity.storage_key()?;
            let record = Record::new(encode(descriptor.kind, entity)?, entity.indexed_fields());
            rows.push((key, record));
        }
        let keys: Vec<StorageKey> = rows.iter().map(|(key, _)| key.clone()).collect();

        self.durable.put_multi(rows).await?;
        debug!(kind = descriptor.kind, count = keys.len(), "Wrote entity batch");

        let mut report = BatchWriteReport {
            written: keys.len(),
            invalidation_failures: Vec::new(),
        };
        for key in &keys {
            if let Err(source) = self.invalidate(&descriptor, key).await {
                warn!(key = %key.cache_key(), error = %source, "Cache invalidation failed after batch commit");
                report.invalidation_failures.push(key.cache_key());
            }
        }
        Ok(report)
    }

    /// Drop the cache entry for `entity` without touching the durable row.
    /// Clearing an absent entry succeeds.
    pub async fn clear_cache<T: Entity>(&self, entity: &T) -> TierResult<()> {
        let key = entity.storage_key()?;
        self.cache
            .delete(&key.cache_key())
            .await
            .map(|_| ())
            .map_err(|e| TierError::Cache(e.into_cache_error()))
    }
}

/// Decode `payload` onto `entity`, tolerating schema drift in either
/// direction.
fn load_into<T: Entity>(
    descriptor: &EntityDescriptor,
    key: &StorageKey,
    entity: &mut T,
    payload: &[u8],
) -> TierResult<()> {
    let decoded = decode_onto(descriptor.kind, payload, &*entity)?;
    if decoded.has_field_mismatch() {
        let mismatch = StorageError::FieldMismatch {
            kind: key.kind().to_string(),
            id: key.id().to_string(),
            fields: decoded.mismatched_fields.clone(),
        };
        debug!(error = %mismatch, "Tolerating stored schema drift");
    }
    *entity = decoded.into_value();
    Ok(())
}

struct ModifyBody<'a, T, F> {
    descriptor: EntityDescriptor,
    key: StorageKey,
    entity: &'a mut T,
    mutate: F,
}

#[async_trait]
impl<'a, T, F> TransactionBody for ModifyBody<'a, T, F>
where
    T: Entity,
    F: FnMut(&mut T) -> TierResult<()> + Send,
{
    async fn run(&mut self, txn: &mut dyn Transaction) -> TierResult<()> {
        self.descriptor.reset_for_retry(self.entity);

        let record = txn
            .get(&self.key)
            .await?
            .ok_or_else(|| TierError::not_found(self.key.kind(), self.key.id()))?;
        load_into(&self.descriptor, &self.key, self.entity, &record.payload)?;
        self.descriptor.after_read(self.entity);

        (self.mutate)(self.entity)?;

        self.descriptor.before_write(self.entity);
        let payload = encode(self.descriptor.kind, &*self.entity)?;
        txn.put(
            self.key.clone(),
            Record::new(payload, self.entity.indexed_fields()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheTier;
    use crate::durable::InMemoryDurableStore;
    use tierstore_core::{Outcome, RetryConfig};
    use tierstore_test_utils::fixtures::{Counter, Profile};

    type Store = EntityStore<InMemoryDurableStore, InMemoryCacheTier>;

    fn store() -> Store {
        EntityStore::new(
            Arc::new(InMemoryDurableStore::with_retry(RetryConfig::immediate(20))),
            Arc::new(InMemoryCacheTier::new()),
            StoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let store = store();
        let mut shell = Counter::shell("nope");
        let err = store.read(&mut shell).await.expect_err("missing");
        assert_eq!(err.outcome(), Outcome::NotFound);
    }

    #[tokio::test]
    async fn test_write_then_read_populates_cache() {
        let store = store();
        let mut counter = Counter::new("c1", 5);
        store.write(&mut counter).await.expect("write");
        assert!(!store.cache().contains("counters:c1"));

        let mut shell = Counter::shell("c1");
        assert_eq!(store.read(&mut shell).await.expect("read"), ReadSource::Durable);
        assert_eq!(shell.value, 5);
        assert!(store.cache().contains("counters:c1"));

        let mut again = Counter::shell("c1");
        assert_eq!(store.read(&mut again).await.expect("read"), ReadSource::Cache);
        assert_eq!(again, counter);
    }

    #[tokio::test]
    async fn test_write_invalidates_previous_cache_entry() {
        let store = store();
        let mut counter = Counter::new("c1", 1);
        store.write(&mut counter).await.expect("write");
        store.read(&mut Counter::shell("c1")).await.expect("warm cache");

        counter.value = 2;
        store.write(&mut counter).await.expect("overwrite");
        let mut shell = Counter::shell("c1");
        assert_eq!(store.read(&mut shell).await.expect("read"), ReadSource::Durable);
        assert_eq!(shell.value, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let store = store();
        let mut counter = Counter::new("c1", 1);
        store.write(&mut counter).await.expect("write");
        store.read(&mut Counter::shell("c1")).await.expect("warm cache");

        store.delete(&counter).await.expect("delete");
        assert!(!store.cache().contains("counters:c1"));
        assert!(store.read(&mut Counter::shell("c1")).await.expect_err("gone").is_not_found());
        store.delete(&counter).await.expect("deleting again is fine");
    }

    #[tokio::test]
    async fn test_modify_applies_mutation_and_invalidates() {
        let store = store();
        store.write(&mut Counter::new("c1", 5)).await.expect("write");
        store.read(&mut Counter::shell("c1")).await.expect("warm cache");

        let mut counter = Counter::shell("c1");
        let report = store
            .modify(&mut counter, |c| {
                c.value += 1;
                Ok(())
            })
            .await
            .expect("modify");
        assert_eq!(report.attempts, 1);
        assert_eq!(counter.value, 6);
        assert!(!store.cache().contains("counters:c1"));
    }

    #[tokio::test]
    async fn test_modify_rejection_is_returned_and_nothing_changes() {
        let store = store();
        store.write(&mut Counter::new("c1", 5)).await.expect("write");

        let mut counter = Counter::shell("c1");
        let err = store
            .modify(&mut counter, |c| {
                c.value = 100;
                Err(TierError::rejected("too big"))
            })
            .await
            .expect_err("rejected");
        assert_eq!(err.outcome(), Outcome::Rejected);

        let mut shell = Counter::shell("c1");
        store.read(&mut shell).await.expect("read");
        assert_eq!(shell.value, 5);
    }

    #[tokio::test]
    async fn test_modify_missing_row_is_not_found() {
        let store = store();
        let err = store
            .modify(&mut Counter::shell("ghost"), |_| Ok(()))
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_hooks_run_on_both_paths() {
        let store = store();
        let mut profile = Profile::new("p1", "Ada Lovelace", "ADA@Example.com");
        store.write(&mut profile).await.expect("write");
        assert_eq!(profile.email, "ada@example.com");
        assert_eq!(profile.revision, 1);

        let mut from_durable = Profile::shell("p1");
        assert_eq!(store.read(&mut from_durable).await.expect("read"), ReadSource::Durable);
        assert_eq!(from_durable.initials, "AL");

        let mut from_cache = Profile::shell("p1");
        assert_eq!(store.read(&mut from_cache).await.expect("read"), ReadSource::Cache);
        assert_eq!(from_cache.initials, "AL");
        assert_eq!(from_cache, from_durable);
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_falls_back_and_is_replaced() {
        let store = store();
        store.write(&mut Counter::new("c1", 3)).await.expect("write");
        store
            .cache()
            .set("counters:c1", b"garbage".to_vec(), Duration::from_secs(60))
            .await
            .expect("poison cache");

        let mut shell = Counter::shell("c1");
        assert_eq!(store.read(&mut shell).await.expect("read"), ReadSource::Durable);
        assert_eq!(shell.value, 3);

        let mut again = Counter::shell("c1");
        assert_eq!(store.read(&mut again).await.expect("read"), ReadSource::Cache);
        assert_eq!(again.value, 3);
    }

    #[tokio::test]
    async fn test_rows_missing_declared_fields_still_load() {
        let store = store();
        let key = Counter::shell("c1").storage_key().expect("key");
        store
            .durable()
            .put(&key, Record::new(br#"{"id":"c1"}"#.to_vec(), Default::default()))
            .await
            .expect("raw put");

        let mut shell = Counter::shell("c1");
        shell.value = 41;
        assert_eq!(store.read(&mut shell).await.expect("read"), ReadSource::Durable);
        assert_eq!(shell.value, 41);

        let mut counter = Counter::shell("c1");
        store
            .modify(&mut counter, |c| {
                c.value += 1;
                Ok(())
            })
            .await
            .expect("modify");
        assert_eq!(counter.value, 1);

        let mut reread = Counter::shell("c1");
        store.read(&mut reread).await.expect("read");
        assert_eq!(reread.value, 1);
    }

    #[tokio::test]
    async fn test_cached_entry_missing_fields_is_served() {
        let store = store();
        store.write(&mut Counter::new("c1", 3)).await.expect("write");
        store
            .cache()
            .set("counters:c1", br#"{"id":"c1"}"#.to_vec(), Duration::from_secs(60))
            .await
            .expect("seed cache");

        let mut shell = Counter::shell("c1");
        shell.value = 8;
        assert_eq!(store.read(&mut shell).await.expect("read"), ReadSource::Cache);
        assert_eq!(shell.value, 8);
    }

    #[tokio::test]
    async fn test_write_batch_reports_written() {
        let store = store();
        let mut counters = vec![Counter::new("a", 1), Counter::new("b", 2), Counter::new("c", 3)];
        let report = store.write_batch(&mut counters).await.expect("batch");
        assert_eq!(report.written, 3);
        assert!(report.is_coherent());

        let mut shell = Counter::shell("b");
        store.read(&mut shell).await.expect("read");
        assert_eq!(shell.value, 2);

        let empty: &mut [Counter] = &mut [];
        assert_eq!(store.write_batch(empty).await.expect("empty batch").written, 0);
    }

    #[tokio::test]
    async fn test_clear_cache_is_idempotent() {
        let store = store();
        store.write(&mut Counter::new("c1", 1)).await.expect("write");
        store.read(&mut Counter::shell("c1")).await.expect("warm");

        let counter = Counter::shell("c1");
        store.clear_cache(&counter).await.expect("clear");
        store.clear_cache(&counter).await.expect("clear again");
        assert!(!store.cache().contains("counters:c1"));
        // The durable row is untouched.
        store.read(&mut Counter::shell("c1")).await.expect("still there");
    }

    #[tokio::test]
    async fn test_cache_ttl_is_capped_by_config() {
        let store = EntityStore::new(
            Arc::new(InMemoryDurableStore::new()),
            Arc::new(InMemoryCacheTier::new()),
            StoreConfig {
                max_cache_ttl: Duration::ZERO,
            },
        );
        store.write(&mut Counter::new("c1", 1)).await.expect("write");
        store.read(&mut Counter::shell("c1")).await.expect("read");
        assert!(!store.cache().contains("counters:c1"));
    }
}
