//! Identity types for tierstore entities

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{ConfigError, TierResult};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Separator byte between kind and id in the binary key.
const SEPARATOR: u8 = 0x00;

/// Separator between kind and id in the cache key rendering.
const CACHE_SEPARATOR: char = ':';

/// Durable storage key derived from an entity's `(kind, id)`.
///
/// # Binary Format
///
/// `encode()` produces `kind || 0x00 || id`. Kinds are restricted to
/// `[A-Za-z0-9_.-]`, so the separator can never appear inside a kind and
/// keys of one kind sort contiguously in byte-ordered backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    kind: String,
    id: String,
}

impl StorageKey {
    /// Create a storage key, validating the kind and id.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> TierResult<Self> {
        let kind = kind.into();
        let id = id.into();
        validate_kind(&kind)?;
        if id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "id".to_string(),
                value: String::new(),
                reason: "entity id must not be empty".to_string(),
            }
            .into());
        }
        Ok(Self { kind, id })
    }

    /// The entity kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The entity id, unique within its kind.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Render the key used with the cache tier: `"{kind}:{id}"`.
    pub fn cache_key(&self) -> String {
        format!("{}{}{}", self.kind, CACHE_SEPARATOR, self.id)
    }

    /// Encode this key for byte-ordered durable backends.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.kind.len() + 1 + self.id.len());
        bytes.extend_from_slice(self.kind.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.id.as_bytes());
        bytes
    }

    /// Decode a key produced by [`StorageKey::encode`].
    ///
    /// Returns `None` if the separator is missing, either half is not
    /// UTF-8, or the kind is not a valid kind.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let kind = std::str::from_utf8(&bytes[..split]).ok()?;
        let id = std::str::from_utf8(&bytes[split + 1..]).ok()?;
        Self::new(kind, id).ok()
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Check that a kind is non-empty and uses only `[A-Za-z0-9_.-]`.
pub fn validate_kind(kind: &str) -> TierResult<()> {
    if kind.is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "kind".to_string(),
        }
        .into());
    }
    let valid = kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid {
        return Err(ConfigError::InvalidValue {
            field: "kind".to_string(),
            value: kind.to_string(),
            reason: "kind may only contain ASCII alphanumerics, '_', '-' or '.'".to_string(),
        }
        .into());
    }
    Ok(())
}
