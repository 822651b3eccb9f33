//! tierstore Core - Entity Identity, Capabilities, Codec and Errors
//!
//! Pure types shared by every other crate. The storage tiers, the entity
//! store and the sweep live in `tierstore-storage`.

pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod entity;
pub mod error;
pub mod identity;

pub use clock::{Clock, SystemClock};
pub use codec::{decode, decode_onto, encode, Decoded};
pub use config::{RetryConfig, StoreConfig, SweepConfig};
pub use entity::{Capabilities, Entity, EntityDescriptor, IndexedFields};
pub use error::{
    CacheError, CodecError, ConfigError, Outcome, StorageError, TierError, TierResult,
    ValidationError,
};
pub use identity::{validate_kind, StorageKey, Timestamp};
