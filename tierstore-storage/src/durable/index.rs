//! Byte layout of timestamp index entries.
//!
//! An index entry is `kind 0x00 field 0x00 <ts: 12 bytes> <storage key>`,
//! where the timestamp is the whole-second count with its sign bit flipped
//! followed by the subsecond nanoseconds, both big-endian, so byte order
//! equals time order at full precision. Entries for one
//! `(kind, field)` pair are contiguous and sorted by time, then key.

use tierstore_core::{StorageKey, Timestamp};

const SEPARATOR: u8 = 0x00;
const TS_LEN: usize = 12;

/// Prefix shared by every entry of `(kind, field)`.
pub fn prefix(kind: &str, field: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(kind.len() + field.len() + 2);
    out.extend_from_slice(kind.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(field.as_bytes());
    out.push(SEPARATOR);
    out
}

fn encode_ts(ts: Timestamp) -> [u8; TS_LEN] {
    let mut out = [0u8; TS_LEN];
    out[..8].copy_from_slice(&((ts.timestamp() as u64) ^ (1u64 << 63)).to_be_bytes());
    out[8..].copy_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
    out
}

/// Full index entry for `key` at `ts`.
pub fn entry(kind: &str, field: &str, ts: Timestamp, key: &StorageKey) -> Vec<u8> {
    let mut out = prefix(kind, field);
    out.extend_from_slice(&encode_ts(ts));
    out.extend_from_slice(&key.encode());
    out
}

/// Exclusive upper bound: every entry of `(kind, field)` timestamped strictly
/// before `before` sorts below it, every other entry sorts at or above it.
pub fn upper_bound(kind: &str, field: &str, before: Timestamp) -> Vec<u8> {
    let mut out = prefix(kind, field);
    out.extend_from_slice(&encode_ts(before));
    out
}

/// Recover the storage key from an entry carrying `prefix_len` prefix bytes.
pub fn key_of(entry: &[u8], prefix_len: usize) -> Option<StorageKey> {
    entry
        .get(prefix_len + TS_LEN..)
        .and_then(StorageKey::decode)
}

/// All index entries for a record's indexed fields.
pub fn entries_for(key: &StorageKey, indexed: &tierstore_core::IndexedFields) -> Vec<Vec<u8>> {
    indexed
        .iter()
        .map(|(field, ts)| entry(key.kind(), field, *ts, key))
        .collect()
}
