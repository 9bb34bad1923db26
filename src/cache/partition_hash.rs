//! Deterministic partition → key-prefix hashing with bounded LRU (§4.E).
//!
//! The prefix itself is just `SHA-256(topic_id ‖ partition_id)` truncated to
//! 16 bytes — deterministic and collision-resistant enough for routing keys
//! across the LSM key space, reusing `sha2` (already a teacher dependency)
//! rather than reaching for a dedicated hashing crate. The cache in front
//! of it is an amortization: losing it and recomputing is always safe, it
//! just costs a hash.

use crate::common::BoundedHashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

const PREFIX_LEN: usize = 16;

/// `(topic_id, partition_id) -> key_prefix` with strict LRU eviction under
/// `max_size` (§6 `partition_hash_cache_max_size`, default 100 000).
pub struct PartitionHashCache {
    inner: Mutex<BoundedHashMap<(String, i32), Vec<u8>>>,
}

impl PartitionHashCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedHashMap::new(max_size.max(1))),
        }
    }

    /// Returns the key prefix for `(topic_id, partition_id)`, computing and
    /// caching it on first use. Always returns the same bytes for the same
    /// input regardless of cache state — the cache is never consulted as a
    /// source of truth, only as a shortcut.
    pub fn prefix_for(&self, topic_id: &str, partition_id: i32) -> Vec<u8> {
        let key = (topic_id.to_string(), partition_id);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&key) {
            return existing.clone();
        }
        let prefix = compute_prefix(topic_id, partition_id);
        inner.insert(key, prefix.clone());
        prefix
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

fn compute_prefix(topic_id: &str, partition_id: i32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(topic_id.as_bytes());
    hasher.update(partition_id.to_be_bytes());
    hasher.finalize()[..PREFIX_LEN].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_always_maps_to_same_prefix() {
        let cache = PartitionHashCache::new(10);
        let a = cache.prefix_for("orders", 3);
        let b = cache.prefix_for("orders", 3);
        assert_eq!(a, b);
    }

    #[test]
    fn different_partitions_map_to_different_prefixes() {
        let cache = PartitionHashCache::new(10);
        let a = cache.prefix_for("orders", 0);
        let b = cache.prefix_for("orders", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn eviction_does_not_change_the_computed_prefix() {
        let cache = PartitionHashCache::new(1);
        let a = cache.prefix_for("orders", 0);
        // Evicts the first entry from the bounded map.
        let _ = cache.prefix_for("orders", 1);
        let a_again = cache.prefix_for("orders", 0);
        assert_eq!(a, a_again);
    }
}
