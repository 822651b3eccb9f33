//! Expiring key-value table.
//!
//! A thin layer over [`EntityStore`]: rows of kind `kvs` keyed by a string,
//! holding an opaque value and an optional absolute expiration. Expired rows
//! are invisible to [`KvTable::find`] even before the
//! [`GarbageCollector`](crate::gc::GarbageCollector) removes them.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tierstore_core::{
    Capabilities, CodecError, Entity, IndexedFields, TierError, TierResult, Timestamp,
    ValidationError,
};

use crate::cache::CacheTier;
use crate::durable::DurableStore;
use crate::entity_store::EntityStore;

/// Kind under which KV rows are stored.
pub const KV_KIND: &str = "kvs";

/// Indexed field holding a row's expiration.
pub const EXPIRES_FIELD: &str = "expires";

/// zstd level used by [`KvRow::compress`].
const COMPRESSION_LEVEL: i32 = 3;

/// One key-value pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRow {
    pub key: String,
    pub value: Vec<u8>,
    /// Absolute expiration. `None` never expires and is never swept.
    #[serde(default)]
    pub expires: Option<Timestamp>,
    /// Relative lifetime, converted to `expires` by [`KvTable::put`].
    /// Not persisted.
    #[serde(skip)]
    pub ttl: Option<Duration>,
}

impl KvRow {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_expires(mut self, expires: Timestamp) -> Self {
        self.expires = Some(expires);
        self
    }

    fn shell(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    /// True once `now` has reached the expiration.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Replace the value with its zstd-compressed form.
    pub fn compress(&mut self) -> TierResult<()> {
        self.value = zstd::encode_all(self.value.as_slice(), COMPRESSION_LEVEL).map_err(|e| {
            CodecError::Encode {
                kind: KV_KIND.to_string(),
                reason: format!("zstd compression failed: {}", e),
            }
        })?;
        Ok(())
    }

    /// Replace the value with its zstd-decompressed form.
    pub fn decompress(&mut self) -> TierResult<()> {
        self.value = zstd::decode_all(self.value.as_slice()).map_err(|e| CodecError::Decode {
            kind: KV_KIND.to_string(),
            reason: format!("zstd decompression failed: {}", e),
        })?;
        Ok(())
    }

    /// Set the value to the JSON encoding of `value`.
    pub fn encode_value<T: Serialize>(&mut self, value: &T) -> TierResult<()> {
        self.value = serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            kind: KV_KIND.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Decode the value as JSON.
    pub fn decode_value<T: DeserializeOwned>(&self) -> TierResult<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            CodecError::Decode {
                kind: KV_KIND.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl Entity for KvRow {
    const CAPABILITIES: Capabilities = Capabilities::CACHEABLE;

    fn kind() -> &'static str {
        KV_KIND
    }

    fn entity_id(&self) -> String {
        self.key.clone()
    }

    /// Remaining lifetime; unbounded rows defer to the store's TTL ceiling.
    fn cache_ttl(&self, now: Timestamp) -> Duration {
        match self.expires {
            None => Duration::MAX,
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }

    fn indexed_fields(&self) -> IndexedFields {
        let mut fields = IndexedFields::new();
        if let Some(at) = self.expires {
            fields.insert(EXPIRES_FIELD.to_string(), at);
        }
        fields
    }
}

/// Expiring KV table over an entity store.
pub struct KvTable<D: ?Sized, C: ?Sized> {
    store: EntityStore<D, C>,
}

impl<D: ?Sized, C: ?Sized> Clone for KvTable<D, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<D, C> KvTable<D, C>
where
    D: DurableStore + ?Sized,
    C: CacheTier + ?Sized,
{
    pub fn new(store: EntityStore<D, C>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &EntityStore<D, C> {
        &self.store
    }

    /// Store `row` until its expiration.
    ///
    /// A set `ttl` is converted to `expires = now + ttl` and cleared;
    /// otherwise `expires` is kept as given.
    pub async fn put(&self, row: &mut KvRow) -> TierResult<()> {
        if let Some(ttl) = row.ttl.take().filter(|ttl| !ttl.is_zero()) {
            let ttl = chrono::Duration::from_std(ttl).map_err(|e| invalid_ttl(e.to_string()))?;
            let expires = self
                .store
                .clock()
                .now()
                .checked_add_signed(ttl)
                .ok_or_else(|| invalid_ttl("expiration out of range".to_string()))?;
            row.expires = Some(expires);
        }
        self.store.write(row).await
    }

    /// Find a live row.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key does not exist or has expired, whether or not
    /// the expired row has been swept yet.
    pub async fn find(&self, key: &str) -> TierResult<KvRow> {
        let mut row = KvRow::shell(key);
        self.store.read(&mut row).await?;
        if row.is_expired(self.store.clock().now()) {
            return Err(TierError::not_found(KV_KIND, key));
        }
        Ok(row)
    }

    /// Delete a row. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> TierResult<()> {
        self.store.delete(&KvRow::shell(key)).await
    }
}

fn invalid_ttl(reason: String) -> TierError {
    ValidationError::InvalidValue {
        field: "ttl".to_string(),
        reason,
    }
    .into()
}
