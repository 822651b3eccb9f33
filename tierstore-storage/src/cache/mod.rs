//! Cache tier: a best-effort, TTL-bounded accelerator in front of the durable
//! store.
//!
//! The cache is never a source of truth. Reads fall through to the durable
//! store on any miss or cache error, and writers invalidate rather than
//! populate, so the worst a failing cache can do is serve an entry until its
//! TTL runs out.
//!
//! # Example
//!
//! ```ignore
//! let cache = InMemoryCacheTier::new();
//! cache.set("kvs:a", payload, Duration::from_secs(60)).await?;
//! assert!(cache.delete("kvs:a").await?);
//! // Deleting again reports absence, which invalidation treats as success.
//! assert!(!cache.delete("kvs:a").await?);
//! ```

pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use lmdb_backend::LmdbCacheTier;
pub use memory::InMemoryCacheTier;
pub use traits::{CacheStats, CacheTier};
