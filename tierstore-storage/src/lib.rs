//! tierstore Storage - Durable and Cache Tiers, Entity Store and Sweep
//!
//! Defines the two storage capabilities the entity store is built on, a
//! durable store and a cache tier, with in-memory and LMDB implementations
//! of each. On top of them sit the cache-coherent [`EntityStore`], the
//! expiring [`KvTable`], its [`GarbageCollector`] and the scheduled sweep
//! task, and monotonic [`Sequence`]s.
//!
//! # Example
//!
//! ```ignore
//! let store = EntityStore::new(
//!     Arc::new(LmdbDurableStore::open("/var/lib/tierstore/rows", 1024)?),
//!     Arc::new(LmdbCacheTier::open("/var/lib/tierstore/cache", 256)?),
//!     StoreConfig::from_env(),
//! );
//!
//! store.write(&mut counter).await?;
//! store
//!     .modify(&mut counter, |c| {
//!         c.value += 1;
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod advisory;
pub mod cache;
pub mod durable;
pub mod entity_store;
pub mod gc;
pub mod jobs;
pub mod kv;
pub mod lmdb;
pub mod sequence;

pub use cache::{CacheStats, CacheTier, InMemoryCacheTier, LmdbCacheTier};
pub use durable::{
    Cursor, DurableStore, InMemoryDurableStore, LmdbDurableStore, Page, RangeQuery, Record,
    Transaction, TransactionBody,
};
pub use entity_store::{BatchWriteReport, EntityStore, ModifyReport, ReadSource};
pub use gc::{GarbageCollector, SweepOutcome, SweepReport};
pub use jobs::{sweep_task, SweepMetrics, SweepSnapshot, SweepTaskConfig};
pub use kv::{KvRow, KvTable, EXPIRES_FIELD, KV_KIND};
pub use lmdb::LmdbError;
pub use sequence::{Sequence, SEQUENCE_KIND};
