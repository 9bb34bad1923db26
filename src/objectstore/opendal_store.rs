//! Production object-store client backed by `opendal`'s generic `Operator`
//! (grounded on the `opendal` usage in the retrieval pack's Rust object-
//! storage layers — one operator abstraction fronting S3-compatible,
//! filesystem, and in-memory backends rather than a bespoke per-provider
//! client for each).

use super::{ObjectInfo, ObjectStoreClient, PutResult};
use crate::error::{Result, TektiteError};
use async_trait::async_trait;
use opendal::{ErrorKind as OpErrorKind, Operator};
use std::time::Duration;

pub struct OpendalObjectStore {
    op: Operator,
}

impl OpendalObjectStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    fn path(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    /// Classify an opendal error the way §7 requires: anything that looks
    /// transient (timeouts, connection resets, backend unavailability)
    /// becomes `Unavailable`; everything else is a terminal `Fatal` at this
    /// layer (callers that know better, e.g. the holder's CAS check on
    /// `ConditionNotMatch`, intercept before reaching this fallback).
    fn classify(err: opendal::Error) -> TektiteError {
        match err.kind() {
            OpErrorKind::Unexpected
            | OpErrorKind::RateLimited
            | OpErrorKind::ConfigInvalid => TektiteError::unavailable(err.to_string()),
            OpErrorKind::NotFound => TektiteError::not_found(err.to_string()),
            _ => TektiteError::unavailable(err.to_string()),
        }
    }

    async fn with_deadline<T>(
        deadline: Duration,
        fut: impl std::future::Future<Output = std::result::Result<T, opendal::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => Err(TektiteError::unavailable("object store call timed out")),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for OpendalObjectStore {
    async fn get(&self, bucket: &str, key: &str, deadline: Duration) -> Result<Vec<u8>> {
        let path = Self::path(bucket, key);
        let buf = Self::with_deadline(deadline, self.op.read(&path)).await?;
        Ok(buf.to_vec())
    }

    async fn get_object_info(
        &self,
        bucket: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<ObjectInfo> {
        let path = Self::path(bucket, key);
        match Self::with_deadline(deadline, self.op.stat(&path)).await {
            Ok(meta) => Ok(ObjectInfo {
                etag: meta.etag().unwrap_or_default().to_string(),
                size: meta.content_length(),
                exists: true,
            }),
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => Ok(ObjectInfo::absent()),
            Err(e) => Err(e),
        }
    }

    async fn put_if_none_match(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        deadline: Duration,
    ) -> Result<PutResult> {
        let path = Self::path(bucket, key);
        let write = self.op.write_with(&path, bytes).if_none_match("*");
        match tokio::time::timeout(deadline, write).await {
            Ok(Ok(_)) => {
                let info = self.get_object_info(bucket, key, deadline).await?;
                Ok(PutResult {
                    ok: true,
                    etag: info.etag,
                })
            }
            Ok(Err(e)) if e.kind() == OpErrorKind::ConditionNotMatch => Ok(PutResult {
                ok: false,
                etag: String::new(),
            }),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => Err(TektiteError::unavailable("object store call timed out")),
        }
    }

    async fn put_if_match_etag(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        etag: &str,
        deadline: Duration,
    ) -> Result<PutResult> {
        let path = Self::path(bucket, key);
        let write = self.op.write_with(&path, bytes).if_match(etag);
        match tokio::time::timeout(deadline, write).await {
            Ok(Ok(_)) => {
                let info = self.get_object_info(bucket, key, deadline).await?;
                Ok(PutResult {
                    ok: true,
                    etag: info.etag,
                })
            }
            Ok(Err(e)) if e.kind() == OpErrorKind::ConditionNotMatch => Ok(PutResult {
                ok: false,
                etag: String::new(),
            }),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => Err(TektiteError::unavailable("object store call timed out")),
        }
    }

    async fn delete(&self, bucket: &str, key: &str, deadline: Duration) -> Result<()> {
        let path = Self::path(bucket, key);
        Self::with_deadline(deadline, self.op.delete(&path)).await
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        deadline: Duration,
    ) -> Result<Vec<String>> {
        let path = Self::path(bucket, prefix);
        let entries = Self::with_deadline(deadline, self.op.list(&path)).await?;
        Ok(entries
            .into_iter()
            .map(|e| e.path()[bucket.len() + 1..].to_string())
            .collect())
    }
}
