//! Internal key/value representations.
//!
//! Keys are opaque, big-endian-ordered byte sequences (§3). Topic/partition
//! keys are built by the pusher/fetcher as `slab-id (u64 BE) ‖ partition-id
//! (u64 BE) ‖ partition-hash ‖ offset (u64 BE)`; this module only owns the
//! ordering and tombstone representation, not that layout — callers compose
//! keys with `LsmKey::from(Vec<u8>)` once they've encoded the fields.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A sorted-index key. `Vec<u8>`'s `Ord` impl is already lexicographic byte
/// ordering, which is the ordering this type needs, so this is a thin
/// newtype rather than a hand-rolled comparator.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct LsmKey(pub Vec<u8>);

impl LsmKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for LsmKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for LsmKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A stored value. A single trailing marker byte distinguishes a tombstone
/// (deletion) from a real write, per §3: "a single-byte tombstone marker at
/// value end distinguishes deletions from writes."
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsmValue {
    Put(Vec<u8>),
    Tombstone,
}

impl LsmValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, LsmValue::Tombstone)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            LsmValue::Put(b) => Some(b),
            LsmValue::Tombstone => None,
        }
    }

    /// Encode for on-disk storage: payload bytes followed by a one-byte
    /// marker (0 = put, 1 = tombstone).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LsmValue::Put(b) => {
                let mut out = Vec::with_capacity(b.len() + 1);
                out.extend_from_slice(b);
                out.push(0);
                out
            }
            LsmValue::Tombstone => vec![1],
        }
    }

    pub fn decode(mut bytes: Vec<u8>) -> crate::error::Result<Self> {
        match bytes.pop() {
            Some(0) => Ok(LsmValue::Put(bytes)),
            Some(1) => Ok(LsmValue::Tombstone),
            Some(_) | None => Err(crate::error::TektiteError::corrupt_table(
                "<unknown>",
                "value missing tombstone marker byte",
            )),
        }
    }
}

/// Builds the internal key for one partition offset: `prefix ‖ offset (u64
/// BE)` (§3 "Topic/partition keys are formed as ... partition-hash ‖
/// offset"). `prefix` is whatever the caller's partition-hash cache
/// produced; this function only owns the suffix.
pub fn partition_key(prefix: &[u8], offset: u64) -> LsmKey {
    let mut bytes = Vec::with_capacity(prefix.len() + 8);
    bytes.extend_from_slice(prefix);
    bytes.extend_from_slice(&offset.to_be_bytes());
    LsmKey::new(bytes)
}

/// Inverse of [`partition_key`]: recovers the trailing offset, given how
/// many prefix bytes precede it. `None` if `key` is too short to have come
/// from `partition_key` with this prefix length.
pub fn decode_offset(key: &LsmKey, prefix_len: usize) -> Option<u64> {
    let bytes = key.as_bytes();
    if bytes.len() < prefix_len + 8 {
        return None;
    }
    let tail = &bytes[prefix_len..prefix_len + 8];
    Some(u64::from_be_bytes(tail.try_into().ok()?))
}

/// An entry as produced by an iterator: a key, a sequence number
/// (higher = newer, used to resolve overlapping versions across levels),
/// and the value (or tombstone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: LsmKey,
    pub sequence: u64,
    pub value: LsmValue,
}

impl Entry {
    pub fn new(key: LsmKey, sequence: u64, value: LsmValue) -> Self {
        Self {
            key,
            sequence,
            value,
        }
    }
}

/// Order entries by key ascending, then by sequence descending, so that
/// within a run of equal keys the newest version sorts first. This is the
/// ordering the merging iterator's heap relies on to pick the winner among
/// overlapping versions without a second pass.
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl Eq for Entry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_through_encode_decode() {
        let v = LsmValue::Put(vec![1, 2, 3]);
        let decoded = LsmValue::decode(v.encode()).unwrap();
        assert_eq!(decoded, v);

        let t = LsmValue::Tombstone;
        let decoded = LsmValue::decode(t.encode()).unwrap();
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn entry_ordering_prefers_newer_sequence_at_equal_key() {
        let k = LsmKey::new(vec![1]);
        let old = Entry::new(k.clone(), 1, LsmValue::Put(vec![0]));
        let new = Entry::new(k, 2, LsmValue::Put(vec![1]));
        assert!(new < old);
    }

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = LsmKey::new(vec![1, 0]);
        let b = LsmKey::new(vec![1, 1]);
        assert!(a < b);
    }

    #[test]
    fn partition_key_round_trips_its_offset() {
        let prefix = vec![1, 2, 3, 4];
        let key = partition_key(&prefix, 42);
        assert!(key.as_bytes().starts_with(&prefix));
        assert_eq!(decode_offset(&key, prefix.len()), Some(42));
    }

    #[test]
    fn partition_key_orders_by_offset_for_a_fixed_prefix() {
        let prefix = vec![9, 9];
        let low = partition_key(&prefix, 1);
        let high = partition_key(&prefix, 2);
        assert!(low < high);
    }
}
