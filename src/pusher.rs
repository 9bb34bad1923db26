//! Table pusher (§4.G): buffers produce batches per partition, builds
//! SSTables, uploads them, and registers them with the controller before
//! acknowledging the originating produce request.
//!
//! Grounded on `original_source/pusher/pusher.go`'s buffer-then-flush
//! shape: records accumulate per `(topic_id, partition_id)` under a
//! `tokio::sync::Mutex` (never a sync lock, since flushing does object-
//! store IO); a flush is triggered by whichever of `buffer_max_size_bytes`
//! or `write_timeout` fires first, exactly as `pusher/conf.go`'s two knobs
//! imply. The background ticker mirrors the holder's dedicated flush task
//! (`lsm::holder`) rather than a per-partition timer each partition would
//! otherwise need to own.

use crate::cache::PartitionHashCache;
use crate::common::DEFAULT_OBJECT_STORE_CALL_TIMEOUT;
use crate::config::PusherConf;
use crate::controller::ControllerClient;
use crate::error::{ErrorKind, Result, TektiteError};
use crate::lsm::key::{partition_key, LsmKey, LsmValue};
use crate::lsm::manager::{Addition, RegistrationBatch};
use crate::lsm::sstable::{content_table_id, SsTableBuilder};
use crate::objectstore::ObjectStoreClient;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What's actually serialized into the value half of an entry: the
/// Kafka-level record the producer sent, independent of the
/// offset-addressed internal key it was filed under (§3 "Value").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp_millis: u64,
}

/// One record as handed to [`TablePusher::produce`], before an offset has
/// been assigned.
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic_id: String,
    pub partition_id: i32,
    pub records: Vec<ProduceRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProduceAck {
    pub base_offset: u64,
}

struct PendingRecord {
    key: LsmKey,
    offset: u64,
    timestamp_millis: u64,
    value: LsmValue,
    approx_size: usize,
}

#[derive(Default)]
struct PartitionBuffer {
    pending: Vec<PendingRecord>,
    bytes: usize,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    first_buffered_at: Option<Instant>,
}

impl PartitionBuffer {
    fn push(&mut self, record: PendingRecord, waiter: oneshot::Sender<Result<()>>) {
        if self.first_buffered_at.is_none() {
            self.first_buffered_at = Some(Instant::now());
        }
        self.bytes += record.approx_size;
        self.pending.push(record);
        self.waiters.push(waiter);
    }

    fn take(&mut self) -> (Vec<PendingRecord>, Vec<oneshot::Sender<Result<()>>>) {
        self.first_buffered_at = None;
        self.bytes = 0;
        (std::mem::take(&mut self.pending), std::mem::take(&mut self.waiters))
    }
}

/// Buffers, builds, uploads, and registers SSTables on the produce path
/// (§4.G). Cheap to share: every method takes `&self` and internal state is
/// either lock-free (`DashMap`) or behind an async mutex scoped to a single
/// partition's buffer, so concurrent producers on different partitions
/// never contend.
pub struct TablePusher<S: ObjectStoreClient + 'static> {
    conf: PusherConf,
    store: Arc<S>,
    controller: ControllerClient<S>,
    partition_hash: Arc<PartitionHashCache>,
    buffers: DashMap<(String, i32), Arc<AsyncMutex<PartitionBuffer>>>,
    last_offset: DashMap<(String, i32), AtomicU64>,
    /// Etag of this partition's last-written offset checkpoint object, so
    /// `snapshot_offsets` can CAS its way through successive writes instead
    /// of only ever winning the very first one (§6 `offset_snapshot_interval`).
    offset_checkpoint_etag: DashMap<(String, i32), String>,
    stopping: Arc<std::sync::atomic::AtomicBool>,
    background: SyncMutex<Vec<JoinHandle<()>>>,
    offset_bucket: String,
}

impl<S: ObjectStoreClient + 'static> TablePusher<S> {
    pub fn new(
        conf: PusherConf,
        store: Arc<S>,
        controller: ControllerClient<S>,
        partition_hash: Arc<PartitionHashCache>,
    ) -> Arc<Self> {
        let offset_bucket = conf.data_bucket_name.clone();
        Arc::new(Self {
            conf,
            store,
            controller,
            partition_hash,
            buffers: DashMap::new(),
            last_offset: DashMap::new(),
            offset_checkpoint_etag: DashMap::new(),
            stopping: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            background: SyncMutex::new(Vec::new()),
            offset_bucket,
        })
    }

    /// Starts the periodic flush ticker and the offset-checkpoint ticker
    /// (§6 `write_timeout`, `offset_snapshot_interval`).
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let flush_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.conf.write_timeout);
            loop {
                interval.tick().await;
                if this.stopping.load(Ordering::SeqCst) {
                    return;
                }
                this.flush_overdue_partitions().await;
            }
        });

        let this = Arc::clone(self);
        let snapshot_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.conf.offset_snapshot_interval);
            loop {
                interval.tick().await;
                if this.stopping.load(Ordering::SeqCst) {
                    return;
                }
                this.snapshot_offsets().await;
            }
        });

        let mut background = self.background.lock();
        background.push(flush_task);
        background.push(snapshot_task);
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for task in self.background.lock().drain(..) {
            task.abort();
        }
    }

    /// Buffers `request`'s records, assigning each the next offset in the
    /// partition, and resolves once the table containing them is durably
    /// registered (§4.G steps 1-4). At-least-once: a caller that times out
    /// waiting on the returned future and retries the whole request gets a
    /// fresh offset block and a duplicate entry downstream — deduplication
    /// is left to an external idempotent-producer layer, not this
    /// component (§4.G "Failure handling").
    pub async fn produce(&self, request: ProduceRequest) -> Result<ProduceAck> {
        let count = request.records.len() as u64;
        if count == 0 {
            let base = self.last_known_offset(&request.topic_id, request.partition_id);
            return Ok(ProduceAck { base_offset: base });
        }

        let base_offset =
            self.controller
                .allocate_offsets(&request.topic_id, request.partition_id, count)?;
        let prefix = self
            .partition_hash
            .prefix_for(&request.topic_id, request.partition_id);
        let now = now_millis();

        let mut rx_list = Vec::with_capacity(request.records.len());
        let key = (request.topic_id.clone(), request.partition_id);
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(PartitionBuffer::default())))
            .value()
            .clone();

        let should_flush = {
            let mut buf = buffer.lock().await;
            for (i, record) in request.records.into_iter().enumerate() {
                let offset = base_offset + i as u64;
                let stored = StoredRecord {
                    key: record.key,
                    value: record.value,
                    timestamp_millis: now,
                };
                let encoded = bincode::encode_to_vec(&stored, bincode::config::standard())?;
                let approx_size = prefix.len() + 8 + encoded.len() + 24;
                let (tx, rx) = oneshot::channel();
                buf.push(
                    PendingRecord {
                        key: partition_key(&prefix, offset),
                        offset,
                        timestamp_millis: now,
                        value: LsmValue::Put(encoded),
                        approx_size,
                    },
                    tx,
                );
                rx_list.push(rx);
            }
            buf.bytes >= self.conf.buffer_max_size_bytes
        };

        if should_flush {
            self.flush_partition(&key).await?;
        }

        for rx in rx_list {
            rx.await
                .map_err(|_| TektiteError::unavailable("pusher dropped produce completion"))??;
        }

        self.last_offset
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_max(base_offset + count, Ordering::SeqCst);

        Ok(ProduceAck { base_offset })
    }

    fn last_known_offset(&self, topic_id: &str, partition_id: i32) -> u64 {
        self.last_offset
            .get(&(topic_id.to_string(), partition_id))
            .map(|v| v.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn flush_overdue_partitions(&self) {
        let due: Vec<(String, i32)> = self
            .buffers
            .iter()
            .filter_map(|entry| {
                let key = entry.key().clone();
                let buffer = entry.value().clone();
                match buffer.try_lock() {
                    Ok(buf) if !buf.pending.is_empty() => {
                        let elapsed = buf
                            .first_buffered_at
                            .map(|t| t.elapsed() >= self.conf.write_timeout)
                            .unwrap_or(false);
                        elapsed.then_some(key)
                    }
                    _ => None,
                }
            })
            .collect();
        for key in due {
            if let Err(e) = self.flush_partition(&key).await {
                tracing::warn!(topic = %key.0, partition = key.1, error = %e, "scheduled flush failed");
            }
        }
    }

    /// Forces an immediate flush of one partition's buffer, bypassing the
    /// periodic ticker. Exposed at `pub(crate)` for the fetcher's own tests
    /// and anything else inside the crate that needs deterministic
    /// durability without waiting on `write_timeout`.
    pub(crate) async fn flush_partition(&self, key: &(String, i32)) -> Result<()> {
        let Some(buffer) = self.buffers.get(key).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let (mut pending, waiters) = {
            let mut buf = buffer.lock().await;
            if buf.pending.is_empty() {
                return Ok(());
            }
            buf.take()
        };
        pending.sort_by(|a, b| a.key.cmp(&b.key));

        match self.build_and_register(&pending).await {
            Ok(()) => {
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                for tx in waiters {
                    let _ = tx.send(Err(e.reclassify()));
                }
                Err(e)
            }
        }
    }

    async fn build_and_register(&self, pending: &[PendingRecord]) -> Result<()> {
        let key_start = pending.first().expect("checked non-empty").key.clone();
        let key_end = pending.last().expect("checked non-empty").key.clone();
        let min_timestamp = pending.iter().map(|p| p.timestamp_millis).min().unwrap_or(0);
        let max_timestamp = pending.iter().map(|p| p.timestamp_millis).max().unwrap_or(0);

        let mut builder = SsTableBuilder::new(self.conf.table_compression, self.conf.table_block_size_target);
        for record in pending {
            builder.add(record.key.clone(), record.offset, record.value.clone());
        }
        let bytes = builder.finish()?;
        let table_id = content_table_id(&bytes);
        let size_bytes = bytes.len() as u64;

        self.upload_table(&table_id, bytes).await?;

        let batch = RegistrationBatch {
            additions: vec![Addition {
                table_id,
                key_start,
                key_end,
                min_timestamp,
                max_timestamp,
                size_bytes,
                level: 0,
            }],
            removals: vec![],
        };
        self.apply_with_retry(batch).await
    }

    /// Uploads `bytes` under `table_id`, idempotent per §4.G step 2: an
    /// existing object at that content-derived ID with a matching size is
    /// treated as success rather than an error. Retries `Unavailable`
    /// failures with exponential backoff until `availability_retry_interval`
    /// elapses (§4.G "Failure handling").
    async fn upload_table(&self, table_id: &str, bytes: Vec<u8>) -> Result<()> {
        let deadline = Instant::now() + self.conf.availability_retry_interval;
        let mut backoff = Duration::from_millis(10);
        loop {
            let attempt = self
                .store
                .put_if_none_match(
                    &self.conf.data_bucket_name,
                    table_id,
                    bytes.clone(),
                    DEFAULT_OBJECT_STORE_CALL_TIMEOUT,
                )
                .await;
            match attempt {
                Ok(put) if put.ok => return Ok(()),
                Ok(_) => {
                    let info = self
                        .store
                        .get_object_info(&self.conf.data_bucket_name, table_id, DEFAULT_OBJECT_STORE_CALL_TIMEOUT)
                        .await?;
                    if info.exists && info.size == bytes.len() as u64 {
                        return Ok(());
                    }
                    return Err(TektiteError::fatal(format!(
                        "table {table_id} already exists with a different size"
                    )));
                }
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submits `batch` to the controller, retrying `Unavailable` (holder
    /// temporarily unreachable, or mid-flush) bounded by
    /// `availability_retry_interval`; `NotLeader` propagates immediately so
    /// the caller re-resolves the controller rather than spinning here
    /// (§4.G "registration `Unavailable` errors retry by re-resolving the
    /// controller" — within this crate, `ControllerClient` already tracks
    /// the current leader, so retrying the same client is the
    /// re-resolution).
    async fn apply_with_retry(&self, batch: RegistrationBatch) -> Result<()> {
        let deadline = Instant::now() + self.conf.availability_retry_interval;
        let mut backoff = Duration::from_millis(10);
        loop {
            match self.controller.apply(batch.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Unavailable && Instant::now() < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the last-acknowledged offset per partition to the object
    /// store (§6 `offset_snapshot_interval`). Best-effort in the sense that
    /// a failed checkpoint just means a slightly stale recovery point, not a
    /// lost acknowledgement (the LSM master record remains the source of
    /// truth for what's actually durable) — but each write after the first
    /// must actually land: the checkpoint object already exists past the
    /// first tick, so every later write has to go through
    /// `put_if_match_etag` against the etag left by the previous one, or it
    /// would spuriously fail `put_if_none_match`'s "absent" precondition
    /// forever and the checkpoint would never advance.
    async fn snapshot_offsets(&self) {
        for entry in self.last_offset.iter() {
            let (topic_id, partition_id) = entry.key().clone();
            let offset = entry.value().load(Ordering::SeqCst);
            let object_key = format!("offsets/{topic_id}-{partition_id}");
            let bytes = offset.to_be_bytes().to_vec();
            let prior_etag = self
                .offset_checkpoint_etag
                .get(&(topic_id.clone(), partition_id))
                .map(|e| e.clone());

            let result = match prior_etag {
                None => {
                    self.store
                        .put_if_none_match(&self.offset_bucket, &object_key, bytes, DEFAULT_OBJECT_STORE_CALL_TIMEOUT)
                        .await
                }
                Some(etag) => {
                    self.store
                        .put_if_match_etag(
                            &self.offset_bucket,
                            &object_key,
                            bytes,
                            &etag,
                            DEFAULT_OBJECT_STORE_CALL_TIMEOUT,
                        )
                        .await
                }
            };

            match result {
                Ok(put) if put.ok => {
                    self.offset_checkpoint_etag
                        .insert((topic_id, partition_id), put.etag);
                }
                Ok(_) => {
                    tracing::warn!(
                        topic = %topic_id,
                        partition = partition_id,
                        "offset checkpoint CAS lost; re-reading etag for the next tick"
                    );
                    if let Ok(info) = self
                        .store
                        .get_object_info(&self.offset_bucket, &object_key, DEFAULT_OBJECT_STORE_CALL_TIMEOUT)
                        .await
                    {
                        if info.exists {
                            self.offset_checkpoint_etag
                                .insert((topic_id, partition_id), info.etag);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %topic_id,
                        partition = partition_id,
                        error = %e,
                        "offset checkpoint write failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConf;
    use crate::controller::Controller;
    use crate::objectstore::InMemoryObjectStore;
    use crate::networking::membership::{MemberInfo, MembershipState};
    use std::collections::BTreeMap;

    async fn leader_client(member_id: &str) -> (Arc<Controller<InMemoryObjectStore>>, ControllerClient<InMemoryObjectStore>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut control_conf = ControlConf::default();
        control_conf.lsm_state_write_interval = Duration::from_millis(5);
        let controller = Controller::new(control_conf, store, member_id.to_string());
        let listener = controller.membership_listener();
        let mut members = BTreeMap::new();
        members.insert(
            member_id.to_string(),
            MemberInfo {
                cluster_listen_address: "a".to_string(),
                kafka_listen_address: "a".to_string(),
                az: "az1".to_string(),
            },
        );
        listener(member_id.to_string(), MembershipState { members }).unwrap();
        let client = controller.client();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !client.is_leader() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (controller, client)
    }

    fn test_pusher_conf() -> PusherConf {
        let mut c = PusherConf::default();
        c.write_timeout = Duration::from_secs(30);
        c.buffer_max_size_bytes = 4 * 1024 * 1024;
        c
    }

    #[tokio::test]
    async fn produce_flushes_immediately_when_buffer_exceeds_threshold() {
        let (_controller, client) = leader_client("m1").await;
        let store = Arc::new(InMemoryObjectStore::new());
        let mut conf = test_pusher_conf();
        conf.buffer_max_size_bytes = 1; // flush on first produce
        let pusher = TablePusher::new(conf, store, client, Arc::new(PartitionHashCache::new(100)));

        let ack = pusher
            .produce(ProduceRequest {
                topic_id: "orders".to_string(),
                partition_id: 0,
                records: vec![
                    ProduceRecord {
                        key: Some(b"A".to_vec()),
                        value: b"1".to_vec(),
                    },
                    ProduceRecord {
                        key: Some(b"B".to_vec()),
                        value: b"2".to_vec(),
                    },
                ],
            })
            .await
            .unwrap();
        assert_eq!(ack.base_offset, 0);
    }

    #[tokio::test]
    async fn explicit_flush_call_drains_buffered_partition() {
        let (_controller, client) = leader_client("m1").await;
        let store = Arc::new(InMemoryObjectStore::new());
        let pusher = TablePusher::new(
            test_pusher_conf(),
            store,
            client,
            Arc::new(PartitionHashCache::new(100)),
        );
        let pusher_clone = Arc::clone(&pusher);
        let key = ("orders".to_string(), 0);
        let handle = tokio::spawn(async move {
            pusher_clone
                .produce(ProduceRequest {
                    topic_id: key.0,
                    partition_id: key.1,
                    records: vec![ProduceRecord {
                        key: None,
                        value: b"v".to_vec(),
                    }],
                })
                .await
        });
        // Give the produce call time to buffer before we force a flush.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pusher
            .flush_partition(&("orders".to_string(), 0))
            .await
            .unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ack.base_offset, 0);
    }
}
