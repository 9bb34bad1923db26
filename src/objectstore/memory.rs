//! Etag-correct in-memory object store used throughout the test suite and
//! by any single-process `Agent` that doesn't need a real backend.

use super::{ObjectInfo, ObjectStoreClient, PutResult};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
}

/// A process-local object store with read-after-write consistency and
/// correct `if-none-match` / `if-match-etag` semantics — exactly the
/// contract §1 assumes the real store provides.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    next_etag: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_etag: AtomicU64::new(1),
        }
    }

    fn full_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    fn fresh_etag(&self) -> String {
        let n = self.next_etag.fetch_add(1, Ordering::SeqCst);
        format!("etag-{n}")
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str, _deadline: Duration) -> Result<Vec<u8>> {
        let full = Self::full_key(bucket, key);
        self.objects
            .get(&full)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| crate::error::TektiteError::not_found(format!("no object at {full}")))
    }

    async fn get_object_info(
        &self,
        bucket: &str,
        key: &str,
        _deadline: Duration,
    ) -> Result<ObjectInfo> {
        let full = Self::full_key(bucket, key);
        Ok(match self.objects.get(&full) {
            Some(o) => ObjectInfo {
                etag: o.etag.clone(),
                size: o.bytes.len() as u64,
                exists: true,
            },
            None => ObjectInfo::absent(),
        })
    }

    async fn put_if_none_match(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _deadline: Duration,
    ) -> Result<PutResult> {
        let full = Self::full_key(bucket, key);
        if self.objects.contains_key(&full) {
            return Ok(PutResult {
                ok: false,
                etag: String::new(),
            });
        }
        let etag = self.fresh_etag();
        self.objects.insert(
            full,
            StoredObject {
                bytes,
                etag: etag.clone(),
            },
        );
        Ok(PutResult { ok: true, etag })
    }

    async fn put_if_match_etag(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        etag: &str,
        _deadline: Duration,
    ) -> Result<PutResult> {
        let full = Self::full_key(bucket, key);
        // Entry API under DashMap's shard lock keeps the etag check and the
        // write atomic with respect to concurrent writers racing the same
        // key, giving the compare-and-swap guarantee callers assume.
        match self.objects.get_mut(&full) {
            Some(mut existing) if existing.etag == etag => {
                let new_etag = self.fresh_etag();
                existing.bytes = bytes;
                existing.etag = new_etag.clone();
                Ok(PutResult {
                    ok: true,
                    etag: new_etag,
                })
            }
            Some(_) => Ok(PutResult {
                ok: false,
                etag: String::new(),
            }),
            None => Ok(PutResult {
                ok: false,
                etag: String::new(),
            }),
        }
    }

    async fn delete(&self, bucket: &str, key: &str, _deadline: Duration) -> Result<()> {
        self.objects.remove(&Self::full_key(bucket, key));
        Ok(())
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        _deadline: Duration,
    ) -> Result<Vec<String>> {
        let full_prefix = Self::full_key(bucket, prefix);
        Ok(self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(&full_prefix))
            .map(|e| e.key()[bucket.len() + 1..].to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn if_none_match_only_succeeds_once() {
        let store = InMemoryObjectStore::new();
        let d = Duration::from_secs(1);
        let r1 = store
            .put_if_none_match("b", "k", b"v1".to_vec(), d)
            .await
            .unwrap();
        assert!(r1.ok);
        let r2 = store
            .put_if_none_match("b", "k", b"v2".to_vec(), d)
            .await
            .unwrap();
        assert!(!r2.ok);
    }

    #[tokio::test]
    async fn if_match_etag_rejects_stale_etag() {
        let store = InMemoryObjectStore::new();
        let d = Duration::from_secs(1);
        let r1 = store
            .put_if_none_match("b", "k", b"v1".to_vec(), d)
            .await
            .unwrap();
        let r2 = store
            .put_if_match_etag("b", "k", b"v2".to_vec(), "stale", d)
            .await
            .unwrap();
        assert!(!r2.ok);
        let r3 = store
            .put_if_match_etag("b", "k", b"v2".to_vec(), &r1.etag, d)
            .await
            .unwrap();
        assert!(r3.ok);
        assert_ne!(r3.etag, r1.etag);
    }

    #[tokio::test]
    async fn read_after_write_sees_new_etag() {
        let store = InMemoryObjectStore::new();
        let d = Duration::from_secs(1);
        let r1 = store
            .put_if_none_match("b", "k", b"v1".to_vec(), d)
            .await
            .unwrap();
        let info = store.get_object_info("b", "k", d).await.unwrap();
        assert_eq!(info.etag, r1.etag);
    }
}
