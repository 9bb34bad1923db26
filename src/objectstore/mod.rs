//! Object-store client abstraction (§6 "Object-store client").
//!
//! Everything above this layer — the LSM holder's master-record flush, the
//! table pusher's upload path, the fetcher's cold-path reads — talks to the
//! store only through [`ObjectStoreClient`]. Two implementations ship: an
//! in-memory etag-correct fake (the primary test collaborator, matching
//! §9's "one primary implementation and one in-memory fake" for every
//! pluggable capability) and a production client backed by `opendal`'s
//! generic `Operator`, which already speaks S3/fs/memory backends without
//! this crate hand-rolling per-provider clients.

pub mod memory;
pub mod opendal_store;

pub use memory::InMemoryObjectStore;
pub use opendal_store::OpendalObjectStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Object metadata returned by [`ObjectStoreClient::get_object_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub etag: String,
    pub size: u64,
    pub exists: bool,
}

impl ObjectInfo {
    pub fn absent() -> Self {
        Self {
            etag: String::new(),
            size: 0,
            exists: false,
        }
    }
}

/// Result of a conditional put: whether the condition held, and (on
/// success) the etag the store assigned the new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub ok: bool,
    pub etag: String,
}

/// The object-store operations this crate consumes (§6). Every call takes
/// an explicit deadline rather than relying on a client-wide default, so
/// callers on the holder's flush path (§5 "every object-store call carries
/// a 5 second default deadline") can tune it per use.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn get(&self, bucket: &str, key: &str, deadline: Duration) -> Result<Vec<u8>>;

    async fn get_object_info(
        &self,
        bucket: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<ObjectInfo>;

    /// Conditional put that only succeeds if no object currently exists at
    /// `key`. Used for the LSM master record's very first write (§3
    /// "Lifecycle": "created on first write (conditional put 'if none')").
    async fn put_if_none_match(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        deadline: Duration,
    ) -> Result<PutResult>;

    /// Conditional put that only succeeds if the object's current etag
    /// matches `etag`. Used for every subsequent master-record write; a
    /// mismatch here is how the holder detects it has lost leadership.
    async fn put_if_match_etag(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        etag: &str,
        deadline: Duration,
    ) -> Result<PutResult>;

    async fn delete(&self, bucket: &str, key: &str, deadline: Duration) -> Result<()>;

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        deadline: Duration,
    ) -> Result<Vec<String>>;
}
