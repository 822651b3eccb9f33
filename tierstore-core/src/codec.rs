//! Serialization adapter between entities and opaque byte payloads.
//!
//! Payloads are JSON. Loading an entity goes through [`decode_onto`], which
//! overlays the stored object on the caller's current value: stored fields
//! the type no longer declares are dropped, and declared fields the payload
//! lacks keep the value they already had. Both directions are reported in
//! [`Decoded::mismatched_fields`] instead of failing the load.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{CodecError, TierResult};

/// A decoded value plus the fields on which payload and type disagreed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub value: T,
    /// Stored fields the type does not declare, then declared fields the
    /// payload did not carry.
    pub mismatched_fields: Vec<String>,
}

impl<T> Decoded<T> {
    /// Returns true if payload and type disagreed on any field.
    pub fn has_field_mismatch(&self) -> bool {
        !self.mismatched_fields.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Encode a value to a payload.
pub fn encode<T: Serialize>(kind: &str, value: &T) -> TierResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        CodecError::Encode {
            kind: kind.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn parse(kind: &str, bytes: &[u8]) -> TierResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| {
        CodecError::Decode {
            kind: kind.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn from_value<T: DeserializeOwned>(kind: &str, value: Value) -> TierResult<T> {
    serde_json::from_value(value).map_err(|e| {
        CodecError::Decode {
            kind: kind.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decode a self-contained payload.
///
/// Unknown stored fields are reported, but every declared field without a
/// serde default must be present. Use [`decode_onto`] to load entities.
pub fn decode<T: Serialize + DeserializeOwned>(kind: &str, bytes: &[u8]) -> TierResult<Decoded<T>> {
    let stored = parse(kind, bytes)?;
    let stored_fields: Vec<String> = match &stored {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };

    let value: T = from_value(kind, stored)?;
    let mismatched_fields = match serde_json::to_value(&value) {
        Ok(Value::Object(current)) => stored_fields
            .into_iter()
            .filter(|field| !current.contains_key(field))
            .collect(),
        _ => Vec::new(),
    };

    Ok(Decoded {
        value,
        mismatched_fields,
    })
}

/// Decode a payload on top of `shell`.
///
/// Fields missing from the payload keep the shell's value. Types using
/// `skip_serializing_if` will report skipped fields as mismatched when a
/// payload still carries them.
pub fn decode_onto<T: Serialize + DeserializeOwned>(
    kind: &str,
    bytes: &[u8],
    shell: &T,
) -> TierResult<Decoded<T>> {
    let Value::Object(stored) = parse(kind, bytes)? else {
        return decode(kind, bytes);
    };
    let base = serde_json::to_value(shell).map_err(|e| CodecError::Encode {
        kind: kind.to_string(),
        reason: e.to_string(),
    })?;
    let Value::Object(mut merged) = base else {
        return decode(kind, bytes);
    };

    let mut mismatched_fields: Vec<String> = stored
        .keys()
        .filter(|field| !merged.contains_key(*field))
        .cloned()
        .collect();
    mismatched_fields.extend(
        merged
            .keys()
            .filter(|field| !stored.contains_key(*field))
            .cloned(),
    );

    merged.extend(stored);
    let value: T = from_value(kind, Value::Object(merged))?;
    Ok(Decoded {
        value,
        mismatched_fields,
    })
}
