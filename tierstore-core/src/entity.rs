//! Entity trait and capability set.
//!
//! An entity is a record identified by `(kind, id)`. Everything else about it
//! is opaque to the store except four optional capabilities, declared once per
//! type in [`Entity::CAPABILITIES`]:
//!
//! - `BEFORE_WRITE`: recompute derived fields before the entity is persisted
//! - `AFTER_READ`: recompute derived fields after the entity is loaded
//! - `RESET_FOR_RETRY`: clear accumulating fields before every transaction attempt
//! - `CACHEABLE`: the entity may be served from the cache tier

use std::collections::BTreeMap;
use std::time::Duration;

use bitflags::bitflags;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TierResult;
use crate::identity::{validate_kind, StorageKey, Timestamp};

bitflags! {
    /// Optional hooks an entity type implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// `before_write` recomputes derived fields
        const BEFORE_WRITE = 0b0000_0001;
        /// `after_read` recomputes derived fields
        const AFTER_READ = 0b0000_0010;
        /// `reset_for_retry` clears accumulating fields
        const RESET_FOR_RETRY = 0b0000_0100;
        /// `cache_ttl` is honoured and the entity is cached
        const CACHEABLE = 0b0000_1000;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::empty()
    }
}

/// Named timestamps a durable store indexes for range queries.
pub type IndexedFields = BTreeMap<String, Timestamp>;

/// A record the entity store can persist.
///
/// # Implementation Requirements
///
/// - `kind()` must return the same value for every instance
/// - `entity_id()` must be derivable from a freshly constructed shell, so the
///   store can compute the key before loading
/// - hooks are only called when the matching bit is set in `CAPABILITIES`
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Capabilities this type implements. Defaults to none.
    const CAPABILITIES: Capabilities = Capabilities::empty();

    /// The fixed kind for this record type.
    fn kind() -> &'static str;

    /// The caller-chosen id, unique within the kind.
    fn entity_id(&self) -> String;

    /// Recompute derived fields before writing.
    fn before_write(&mut self) {}

    /// Recompute derived fields after reading.
    fn after_read(&mut self) {}

    /// Reset accumulating fields before a transaction attempt.
    fn reset_for_retry(&mut self) {}

    /// How long the cache tier may hold this entity as of `now`.
    /// Zero disables caching.
    fn cache_ttl(&self, _now: Timestamp) -> Duration {
        Duration::ZERO
    }

    /// Timestamps the durable store should index for this entity.
    fn indexed_fields(&self) -> IndexedFields {
        IndexedFields::new()
    }

    /// Derive the storage key from `(kind, id)`.
    fn storage_key(&self) -> TierResult<StorageKey> {
        StorageKey::new(Self::kind(), self.entity_id())
    }
}

/// Per-type facts computed once when an entity type is registered with a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub kind: &'static str,
    pub capabilities: Capabilities,
}

impl EntityDescriptor {
    /// Describe and validate an entity type.
    pub fn of<T: Entity>() -> TierResult<Self> {
        validate_kind(T::kind())?;
        Ok(Self {
            kind: T::kind(),
            capabilities: T::CAPABILITIES,
        })
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    /// Cache TTL for `entity`, or zero if the type is not cacheable.
    pub fn cache_ttl<T: Entity>(&self, entity: &T, now: Timestamp) -> Duration {
        if self.has(Capabilities::CACHEABLE) {
            entity.cache_ttl(now)
        } else {
            Duration::ZERO
        }
    }

    pub fn before_write<T: Entity>(&self, entity: &mut T) {
        if self.has(Capabilities::BEFORE_WRITE) {
            entity.before_write();
        }
    }

    pub fn after_read<T: Entity>(&self, entity: &mut T) {
        if self.has(Capabilities::AFTER_READ) {
            entity.after_read();
        }
    }

    pub fn reset_for_retry<T: Entity>(&self, entity: &mut T) {
        if self.has(Capabilities::RESET_FOR_RETRY) {
            entity.reset_for_retry();
        }
    }
}
