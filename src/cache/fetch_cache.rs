//! Distributed, rendezvous-hashed SSTable byte cache (§4.F).
//!
//! Every member owns a slice of the table-id key space by rendezvous
//! hashing over the live membership: the owner of `table_id` is whichever
//! live member maximizes `hash(table_id ‖ member_id)`. Owners serve
//! `get_table_bytes` out of a local, byte-budgeted LRU with single-flight
//! collapsing of concurrent misses; non-owners forward to the owner over
//! the internal RPC transport. Losing ownership on a membership change
//! doesn't invalidate anything already cached — entries are retained until
//! evicted, per §4.F ("no invariant that only the owner may cache").

use crate::common::{NodeId, TableId};
use crate::error::{ErrorKind, Result, TektiteError};
use crate::objectstore::ObjectStoreClient;
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// The subset of a `TektiteError` an `OnceCell` can hold (the error type
/// itself isn't `Clone`, and every single-flight waiter needs its own
/// copy of whatever the fetch failed with).
#[derive(Clone)]
struct CachedError {
    kind: ErrorKind,
    message: String,
}

impl From<&TektiteError> for CachedError {
    fn from(e: &TektiteError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl CachedError {
    fn into_error(self) -> TektiteError {
        match self.kind {
            ErrorKind::Unavailable => TektiteError::unavailable(self.message),
            ErrorKind::NotLeader => TektiteError::not_leader(self.message),
            ErrorKind::InvalidArgument => TektiteError::invalid_argument(self.message),
            ErrorKind::NotFound => TektiteError::not_found(self.message),
            ErrorKind::CorruptTable => TektiteError::corrupt_table("<table>", self.message),
            ErrorKind::Fatal => TektiteError::fatal(self.message),
        }
    }
}

type FetchCell = Arc<OnceCell<std::result::Result<Arc<Vec<u8>>, CachedError>>>;

/// Forwards a table-bytes request to a remote owner. Implemented by
/// whatever RPC transport the deployment uses (§6 "Transport"); a
/// single-process `Agent` can stub this out entirely since every table is
/// locally owned.
#[async_trait]
pub trait RemoteTableFetch: Send + Sync {
    async fn fetch_remote(&self, owner: &NodeId, table_id: &str) -> Result<Vec<u8>>;
}

/// Rendezvous-hash `table_id` against the supplied live member set,
/// returning the owner. Stable under an unchanged member set for a fixed
/// `table_id` (§8 "Rendezvous ownership is stable under unchanged
/// membership").
pub fn rendezvous_owner<'a>(table_id: &str, live_members: &'a [NodeId]) -> Option<&'a NodeId> {
    live_members.iter().max_by_key(|m| rendezvous_score(table_id, m))
}

fn rendezvous_score(table_id: &str, member_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(table_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(member_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

pub struct FetchCacheConf {
    pub max_size_bytes: u64,
    pub sstable_bucket_name: String,
    pub object_store_call_timeout: Duration,
}

pub struct FetchCache<S: ObjectStoreClient> {
    local_member_id: NodeId,
    live_members: Arc<RwLock<Vec<NodeId>>>,
    local: Mutex<LruCache<TableId, Arc<Vec<u8>>>>,
    current_bytes: Mutex<u64>,
    max_bytes: u64,
    in_flight: DashMap<TableId, FetchCell>,
    store: Arc<S>,
    bucket: String,
    call_timeout: Duration,
    remote: Option<Arc<dyn RemoteTableFetch>>,
}

impl<S: ObjectStoreClient> FetchCache<S> {
    pub fn new(
        local_member_id: NodeId,
        live_members: Arc<RwLock<Vec<NodeId>>>,
        store: Arc<S>,
        conf: FetchCacheConf,
        remote: Option<Arc<dyn RemoteTableFetch>>,
    ) -> Self {
        Self {
            local_member_id,
            live_members,
            // Capacity here bounds entry count as a safety valve; the real
            // budget is byte-based and enforced in `insert_local`.
            local: Mutex::new(LruCache::new(NonZeroUsize::new(1_000_000).unwrap())),
            current_bytes: Mutex::new(0),
            max_bytes: conf.max_size_bytes,
            in_flight: DashMap::new(),
            store,
            bucket: conf.sstable_bucket_name,
            call_timeout: conf.object_store_call_timeout,
            remote,
        }
    }

    fn is_owner(&self, table_id: &str) -> bool {
        let members = self.live_members.read();
        if members.is_empty() {
            return true;
        }
        rendezvous_owner(table_id, &members) == Some(&self.local_member_id)
    }

    pub async fn get_table_bytes(&self, table_id: &str) -> Result<Arc<Vec<u8>>> {
        if !self.is_owner(table_id) {
            return self.forward(table_id).await;
        }
        if let Some(bytes) = self.local.lock().get(table_id).cloned() {
            return Ok(bytes);
        }
        self.fetch_single_flight(table_id).await
    }

    async fn forward(&self, table_id: &str) -> Result<Arc<Vec<u8>>> {
        let owner = {
            let members = self.live_members.read();
            rendezvous_owner(table_id, &members).cloned()
        };
        let Some(owner) = owner else {
            return self.fetch_single_flight(table_id).await;
        };
        match &self.remote {
            Some(remote) => remote
                .fetch_remote(&owner, table_id)
                .await
                .map(Arc::new),
            None => self.fetch_single_flight(table_id).await,
        }
    }

    /// Owner-side miss path: at-most-one object-store fetch per `table_id`
    /// in flight, with every concurrent caller observing the same result
    /// (§4.F steps 2-3).
    async fn fetch_single_flight(&self, table_id: &str) -> Result<Arc<Vec<u8>>> {
        let cell = self
            .in_flight
            .entry(table_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                match self
                    .store
                    .get(&self.bucket, table_id, self.call_timeout)
                    .await
                {
                    Ok(bytes) => {
                        self.insert_local(table_id.to_string(), Arc::new(bytes.clone()));
                        Ok(Arc::new(bytes))
                    }
                    Err(e) => Err(CachedError::from(&e)),
                }
            })
            .await
            .cloned();

        self.in_flight.remove(table_id);
        result.map_err(CachedError::into_error)
    }

    fn insert_local(&self, table_id: TableId, bytes: Arc<Vec<u8>>) {
        let size = bytes.len() as u64;
        let mut local = self.local.lock();
        let mut current = self.current_bytes.lock();
        while *current + size > self.max_bytes {
            match local.pop_lru() {
                Some((_, evicted)) => *current -= evicted.len() as u64,
                None => break,
            }
        }
        local.put(table_id, bytes);
        *current += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::InMemoryObjectStore;

    fn members(ids: &[&str]) -> Arc<RwLock<Vec<NodeId>>> {
        Arc::new(RwLock::new(ids.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn rendezvous_ownership_is_deterministic_for_fixed_membership() {
        let live = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let o1 = rendezvous_owner("t1", &live).cloned();
        let o2 = rendezvous_owner("t1", &live).cloned();
        assert_eq!(o1, o2);
    }

    #[test]
    fn removing_a_member_only_reassigns_its_own_tables() {
        let live = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let reduced = vec!["m1".to_string(), "m3".to_string()];
        let table_ids: Vec<String> = (0..100).map(|i| format!("t{i}")).collect();

        for table_id in &table_ids {
            let before = rendezvous_owner(table_id, &live).cloned().unwrap();
            let after = rendezvous_owner(table_id, &reduced).cloned().unwrap();
            if before != "m2" {
                assert_eq!(before, after, "owner of {table_id} changed unnecessarily");
            }
        }
    }

    #[tokio::test]
    async fn owner_fetches_from_object_store_and_caches() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put_if_none_match("data", "t1", b"hello".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        let cache = FetchCache::new(
            "m1".to_string(),
            members(&["m1"]),
            store,
            FetchCacheConf {
                max_size_bytes: 1024,
                sstable_bucket_name: "data".to_string(),
                object_store_call_timeout: Duration::from_secs(1),
            },
            None,
        );
        let bytes = cache.get_table_bytes("t1").await.unwrap();
        assert_eq!(&**bytes, b"hello");
        assert_eq!(cache.current_bytes.lock().clone(), 5);
    }

    #[tokio::test]
    async fn byte_budget_evicts_oldest_entries() {
        let store = Arc::new(InMemoryObjectStore::new());
        for id in ["t1", "t2", "t3"] {
            store
                .put_if_none_match("data", id, vec![0u8; 10], Duration::from_secs(1))
                .await
                .unwrap();
        }
        let cache = FetchCache::new(
            "m1".to_string(),
            members(&["m1"]),
            store,
            FetchCacheConf {
                max_size_bytes: 15,
                sstable_bucket_name: "data".to_string(),
                object_store_call_timeout: Duration::from_secs(1),
            },
            None,
        );
        cache.get_table_bytes("t1").await.unwrap();
        cache.get_table_bytes("t2").await.unwrap();
        assert!(*cache.current_bytes.lock() <= 15);
    }
}
