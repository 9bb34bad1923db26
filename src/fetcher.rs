//! Batch fetcher (§4.H): answers Kafka-style fetch requests by range-
//! querying the controller for overlapping tables, pulling their bytes
//! through the fetch cache, merge-iterating the result, and long-polling
//! when nothing new is available yet.
//!
//! Grounded on `kafkaprotocol/protocol.go`'s Fetch request/response shapes
//! combined with this crate's own `MergingIterator`/`FetchCache` components
//! (§4.A, §4.F) — the fetcher itself owns only the range query, the wait,
//! and the final decode, not table storage or caching.

use crate::cache::{FetchCache, PartitionHashCache};
use crate::common::TableId;
use crate::config::FetcherConf;
use crate::controller::ControllerClient;
use crate::error::Result;
use crate::lsm::key::{decode_offset, partition_key, Entry, LsmKey, LsmValue};
use crate::lsm::iterator::{LsmIterator, MergingIterator, StaticIterator};
use crate::lsm::sstable::SsTableReader;
use crate::objectstore::ObjectStoreClient;
use crate::pusher::StoredRecord;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub topic_id: String,
    pub partition_id: i32,
    pub fetch_offset: u64,
    pub max_wait: Option<Duration>,
    pub min_bytes: Option<usize>,
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub offset: u64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub high_watermark: u64,
    pub records: Vec<FetchedRecord>,
}

type WaiterMap = HashMap<(String, i32), Vec<oneshot::Sender<()>>>;

/// Answers fetch requests against the LSM (§4.H). Holds no buffered data
/// of its own: every read goes through the controller for the current
/// table set and through the fetch cache for bytes.
pub struct BatchFetcher<S: ObjectStoreClient + 'static> {
    conf: FetcherConf,
    controller: ControllerClient<S>,
    cache: Arc<FetchCache<S>>,
    partition_hash: Arc<PartitionHashCache>,
    waiters: SyncMutex<WaiterMap>,
    notify_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl<S: ObjectStoreClient + 'static> BatchFetcher<S> {
    pub fn new(
        conf: FetcherConf,
        controller: ControllerClient<S>,
        cache: Arc<FetchCache<S>>,
        partition_hash: Arc<PartitionHashCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conf,
            controller,
            cache,
            partition_hash,
            waiters: SyncMutex::new(HashMap::new()),
            notify_task: SyncMutex::new(None),
        })
    }

    /// Subscribes to the controller's table-registration broadcast and
    /// wakes any fetch parked on a partition whose high watermark might
    /// have moved. Per §4.H "Long-poll fairness": we don't know which
    /// partitions a notification touched without re-reading the table
    /// metadata, so a registration wakes every currently-parked fetch —
    /// each one re-checks its own condition under `self.waiters`'s lock
    /// before deciding whether it actually has new data.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut rx = this.controller.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) => this.wake_all_waiters(),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        this.wake_all_waiters();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        *self.notify_task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_task.lock().take() {
            handle.abort();
        }
        self.wake_all_waiters();
    }

    fn wake_all_waiters(&self) {
        let mut waiters = self.waiters.lock();
        for (_, senders) in waiters.drain() {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    /// Computes the high watermark for a partition: one past the highest
    /// offset present in any registered table under that partition's
    /// prefix (§3 "High watermark"). An empty partition's watermark is its
    /// starting offset, taken to be zero (no per-topic base offsets in
    /// this crate's model).
    pub async fn high_watermark(&self, topic_id: &str, partition_id: i32) -> Result<u64> {
        let prefix = self.partition_hash.prefix_for(topic_id, partition_id);
        let prefix_key = LsmKey::new(prefix.clone());
        let table_ids = self
            .controller
            .get_tables_for_highest_key_with_prefix(&prefix_key)?;
        if table_ids.is_empty() {
            return Ok(0);
        }

        let mut highest = 0u64;
        for table_id in table_ids {
            let bytes = self.cache.get_table_bytes(&table_id).await?;
            let reader = SsTableReader::open(&table_id, bytes.as_ref().clone())?;
            let (_, key_end) = reader.table_id_range();
            if let Some(offset) = decode_offset(key_end, prefix.len()) {
                highest = highest.max(offset);
            }
        }
        Ok(highest + 1)
    }

    /// Serves one fetch request, parking up to `max_wait` (or the
    /// configured default) if `fetch_offset` is already at or beyond the
    /// current high watermark (§4.H "Long poll"). Spurious wakeups are
    /// harmless: the loop always re-checks the watermark after waking or
    /// timing out, and missed wakeups are bounded by that same re-check —
    /// a waiter registers itself under `self.waiters`'s lock before giving
    /// up control, so a notification that lands between the check and the
    /// registration is never possible; one that lands before the
    /// registration is caught by re-checking first.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let max_wait = request.max_wait.unwrap_or(self.conf.max_fetch_wait);
        let deadline = Instant::now() + max_wait;
        let key = (request.topic_id.clone(), request.partition_id);

        loop {
            let high_watermark = self.high_watermark(&request.topic_id, request.partition_id).await?;
            if request.fetch_offset < high_watermark {
                let records = self.read_records(&request, high_watermark).await?;
                return Ok(FetchResponse {
                    high_watermark,
                    records,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(FetchResponse {
                    high_watermark,
                    records: Vec::new(),
                });
            }

            let (tx, rx) = oneshot::channel();
            {
                let mut waiters = self.waiters.lock();
                waiters.entry(key.clone()).or_default().push(tx);
            }
            let _ = tokio::time::timeout(deadline - now, rx).await;
        }
    }

    /// Builds a merging iterator over every table overlapping
    /// `[fetch_offset, high_watermark)` for the partition and decodes the
    /// winning entries back into Kafka-level records, respecting
    /// `max_bytes` (§4.H steps 2-4).
    async fn read_records(&self, request: &FetchRequest, high_watermark: u64) -> Result<Vec<FetchedRecord>> {
        let prefix = self.partition_hash.prefix_for(&request.topic_id, request.partition_id);
        let start_key = partition_key(&prefix, request.fetch_offset);
        let end_key = partition_key(&prefix, high_watermark);

        let overlapping = self.controller.query_tables_in_range(&start_key, &end_key)?;
        let table_ids = overlapping.all_table_ids();
        if table_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut children: Vec<Box<dyn LsmIterator>> = Vec::with_capacity(table_ids.len());
        for table_id in dedup(table_ids) {
            let entries = self.table_entries(&table_id, &start_key, &end_key).await?;
            children.push(Box::new(StaticIterator::new(entries)));
        }

        let mut merged = MergingIterator::new(children)?;
        let max_bytes = request.max_bytes.unwrap_or(self.conf.max_fetch_bytes);
        let mut records = Vec::new();
        let mut consumed_bytes = 0usize;

        while merged.is_valid()? {
            let entry = merged.current().expect("is_valid checked").clone();
            if let Some(offset) = decode_offset(&entry.key, prefix.len()) {
                if offset >= request.fetch_offset && offset < high_watermark {
                    if let LsmValue::Put(bytes) = &entry.value {
                        let (stored, _): (StoredRecord, usize) =
                            bincode::decode_from_slice(bytes, bincode::config::standard())?;
                        consumed_bytes += bytes.len();
                        records.push(FetchedRecord {
                            offset,
                            key: stored.key,
                            value: stored.value,
                            timestamp_millis: stored.timestamp_millis,
                        });
                        if consumed_bytes >= max_bytes {
                            break;
                        }
                    }
                    // Tombstones are filtered silently: once compaction
                    // removes the entry they cover, it simply stops
                    // appearing, matching a deleted record (§3 "Tombstones").
                }
            }
            merged.next()?;
        }

        records.sort_by_key(|r| r.offset);
        Ok(records)
    }

    async fn table_entries(&self, table_id: &TableId, start: &LsmKey, end: &LsmKey) -> Result<Vec<Entry>> {
        let bytes = self.cache.get_table_bytes(table_id).await?;
        let reader = Arc::new(SsTableReader::open(table_id, bytes.as_ref().clone())?);
        let mut iter = Arc::clone(&reader).iter()?;
        let mut entries = Vec::new();
        while iter.is_valid()? {
            let entry = iter.current().expect("is_valid checked");
            if entry.key >= *start && entry.key < *end {
                entries.push(entry.clone());
            }
            iter.next()?;
        }
        Ok(entries)
    }
}

fn dedup(mut ids: Vec<TableId>) -> Vec<TableId> {
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FetchCacheConf as RuntimeFetchCacheConf;
    use crate::config::ControlConf;
    use crate::controller::Controller;
    use crate::networking::membership::{MemberInfo, MembershipState};
    use crate::objectstore::InMemoryObjectStore;
    use crate::pusher::{ProduceRecord, ProduceRequest, TablePusher};
    use std::collections::BTreeMap;

    async fn wired() -> (
        Arc<TablePusher<InMemoryObjectStore>>,
        Arc<BatchFetcher<InMemoryObjectStore>>,
    ) {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut control_conf = ControlConf::default();
        control_conf.lsm_state_write_interval = Duration::from_millis(5);
        let controller = Controller::new(control_conf, Arc::clone(&store), "m1".to_string());
        let listener = controller.membership_listener();
        let mut members = BTreeMap::new();
        members.insert(
            "m1".to_string(),
            MemberInfo {
                cluster_listen_address: "a".to_string(),
                kafka_listen_address: "a".to_string(),
                az: "az1".to_string(),
            },
        );
        listener("m1".to_string(), MembershipState { members }).unwrap();
        let client = controller.client();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !client.is_leader() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let partition_hash = Arc::new(PartitionHashCache::new(100));
        let mut pusher_conf = crate::config::PusherConf::default();
        pusher_conf.write_timeout = Duration::from_secs(30);
        let pusher = TablePusher::new(pusher_conf, Arc::clone(&store), client.clone(), Arc::clone(&partition_hash));

        let live_members = Arc::new(parking_lot::RwLock::new(vec!["m1".to_string()]));
        let cache = FetchCache::new(
            "m1".to_string(),
            live_members,
            Arc::clone(&store),
            RuntimeFetchCacheConf {
                max_size_bytes: 64 * 1024 * 1024,
                sstable_bucket_name: crate::config::ControlConf::default().sstable_bucket_name,
                object_store_call_timeout: Duration::from_secs(5),
            },
            None,
        );
        let fetcher = BatchFetcher::new(FetcherConf::default(), client, Arc::new(cache), partition_hash);
        (pusher, fetcher)
    }

    #[tokio::test]
    async fn fetch_returns_records_produced_before_the_request() {
        let (pusher, fetcher) = wired().await;
        // `produce` doesn't resolve until the batch is durably registered,
        // and nothing flushes the buffer on its own here (write_timeout is
        // 30s and `pusher.start()` was never called) — so the call has to
        // run in its own task while we force the flush from here, same as
        // `explicit_flush_call_drains_buffered_partition` in `pusher.rs`.
        let pusher_clone = Arc::clone(&pusher);
        let handle = tokio::spawn(async move {
            pusher_clone
                .produce(ProduceRequest {
                    topic_id: "orders".to_string(),
                    partition_id: 0,
                    records: vec![
                        ProduceRecord {
                            key: Some(b"k1".to_vec()),
                            value: b"v1".to_vec(),
                        },
                        ProduceRecord {
                            key: Some(b"k2".to_vec()),
                            value: b"v2".to_vec(),
                        },
                    ],
                })
                .await
        });
        // Give the produce call time to buffer before we force a flush.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pusher.flush_partition(&("orders".to_string(), 0)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let response = fetcher
            .fetch(FetchRequest {
                topic_id: "orders".to_string(),
                partition_id: 0,
                fetch_offset: 0,
                max_wait: Some(Duration::from_millis(200)),
                min_bytes: None,
                max_bytes: None,
            })
            .await
            .unwrap();

        assert_eq!(response.high_watermark, 2);
        assert_eq!(response.records.len(), 2);
        assert_eq!(response.records[0].offset, 0);
        assert_eq!(response.records[0].value, b"v1".to_vec());
        assert_eq!(response.records[1].offset, 1);
    }

    #[tokio::test]
    async fn fetch_times_out_with_empty_batch_when_nothing_new_arrives() {
        let (_pusher, fetcher) = wired().await;
        let started = Instant::now();
        let response = fetcher
            .fetch(FetchRequest {
                topic_id: "orders".to_string(),
                partition_id: 0,
                fetch_offset: 0,
                max_wait: Some(Duration::from_millis(50)),
                min_bytes: None,
                max_bytes: None,
            })
            .await
            .unwrap();
        assert_eq!(response.high_watermark, 0);
        assert!(response.records.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
