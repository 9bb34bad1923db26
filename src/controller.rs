//! Controller (§4.J): ties the LSM holder (D, which wraps the in-memory
//! manager C) to leadership derived from the membership manifold (I), and
//! exposes a cheap-to-clone [`ControllerClient`] that the table pusher (G),
//! batch fetcher (H), and the compaction loop use to submit registration
//! batches, query ranges, allocate offset blocks, and subscribe to
//! table-registration notifications.
//!
//! Grounded on `original_source/agent/agent.go`'s `Controller`/`Client`
//! split: exactly one member runs the holder at a time (the lowest live
//! member id, per §3 "Cluster membership state" — "implementation-defined,
//! typically the lowest live member_id"); every other member's client calls
//! return `NotLeader` until membership changes again. The required
//! controller-to-controller RPC forwarding implied by a multi-node
//! deployment isn't part of §6's external-interface list (only the five
//! named handler IDs are), so it's left for the caller to re-resolve, per
//! §7 ("NotLeader ... caller re-resolves the controller and retries") —
//! documented as an Open Question resolution in `DESIGN.md`.

use crate::common::{NodeId, TableId};
use crate::config::ControlConf;
use crate::error::{ErrorKind, Result, TektiteError};
use crate::lsm::holder::LsmHolder;
use crate::lsm::iterator::{LsmIterator, MergingIterator};
use crate::lsm::key::LsmKey;
use crate::lsm::manager::{CompactionJob, OverlappingTables, RegistrationBatch};
use crate::lsm::sstable::{content_table_id, Codec, SsTableBuilder, SsTableReader};
use crate::networking::membership::{MembershipListener, MembershipState};
use crate::objectstore::ObjectStoreClient;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How often a leading controller checks the manager for compaction work.
/// Separate from (and much coarser than) the holder's 10ms flush cadence —
/// compaction is a background cleanup pass, not a latency-sensitive path.
const COMPACTION_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COMPACTION_BLOCK_SIZE_TARGET: usize = 64 * 1024;

/// Fired on every durable registration, §4.H step 5's wake-up signal for
/// long-polling fetchers. Carries just the table IDs — fetchers re-check
/// their own condition under lock rather than trusting the notification
/// payload to tell them whether it's relevant (§4.H "spurious wakeups are
/// allowed").
#[derive(Debug, Clone)]
pub struct TableRegisteredNotification {
    pub table_ids: Vec<TableId>,
}

struct LeaderState<S: ObjectStoreClient + 'static> {
    holder: SyncMutex<Option<Arc<LsmHolder<S>>>>,
    compaction_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl<S: ObjectStoreClient + 'static> Default for LeaderState<S> {
    fn default() -> Self {
        Self {
            holder: SyncMutex::new(None),
            compaction_task: SyncMutex::new(None),
        }
    }
}

pub struct Controller<S: ObjectStoreClient + 'static> {
    conf: ControlConf,
    store: Arc<S>,
    this_member_id: NodeId,
    is_leader: Arc<AtomicBool>,
    /// Bumped on every membership change; a pending `load()` that finishes
    /// after a newer election has already superseded it discards its
    /// result instead of clobbering the current leader's state.
    generation: Arc<AtomicU64>,
    leader_state: Arc<LeaderState<S>>,
    notify: broadcast::Sender<TableRegisteredNotification>,
    offset_blocks: DashMap<(String, i32), AtomicU64>,
    self_weak: SyncMutex<Weak<Controller<S>>>,
}

impl<S: ObjectStoreClient + 'static> Controller<S> {
    pub fn new(conf: ControlConf, store: Arc<S>, this_member_id: NodeId) -> Arc<Self> {
        let (notify, _rx) = broadcast::channel(1024);
        Arc::new_cyclic(|weak| Self {
            conf,
            store,
            this_member_id,
            is_leader: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            leader_state: Arc::new(LeaderState::default()),
            notify,
            offset_blocks: DashMap::new(),
            self_weak: SyncMutex::new(weak.clone()),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn client(self: &Arc<Self>) -> ControllerClient<S> {
        ControllerClient {
            controller: Arc::clone(self),
        }
    }

    /// A [`MembershipListener`] suitable for registering with a
    /// [`crate::networking::MembershipManifold`] (§4.J "binds holder (D)
    /// to leadership derived from (I)").
    pub fn membership_listener(self: &Arc<Self>) -> MembershipListener {
        let this = Arc::clone(self);
        Box::new(move |this_member, state| this.on_membership_changed(this_member, state))
    }

    fn on_membership_changed(&self, this_member: NodeId, state: MembershipState) -> Result<()> {
        let leader = state.live_member_ids().into_iter().min();
        let should_lead = leader.as_ref() == Some(&this_member);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let was_leader = self.is_leader.swap(should_lead, Ordering::SeqCst);

        if should_lead && !was_leader {
            tracing::info!(member = %this_member, "became controller leader");
            self.spawn_become_leader(generation);
        } else if !should_lead && was_leader {
            tracing::info!(member = %this_member, "lost controller leadership");
            self.spawn_step_down();
        }
        Ok(())
    }

    fn upgrade(&self) -> Arc<Self> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("controller outlives its own membership listener")
    }

    fn spawn_become_leader(&self, generation: u64) {
        let this = self.upgrade();
        tokio::spawn(async move {
            match LsmHolder::load(Arc::clone(&this.store), this.conf.clone()).await {
                Ok(holder) => {
                    if this.generation.load(Ordering::SeqCst) != generation {
                        // A newer election already moved on; this load is stale.
                        return;
                    }
                    let holder = Arc::new(holder);
                    holder.start();
                    *this.leader_state.holder.lock() = Some(Arc::clone(&holder));
                    this.spawn_compaction_loop(holder, generation);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load LSM metadata while becoming leader");
                    this.is_leader.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    fn spawn_step_down(&self) {
        let this = self.upgrade();
        tokio::spawn(async move {
            if let Some(task) = this.leader_state.compaction_task.lock().take() {
                task.abort();
            }
            let holder = this.leader_state.holder.lock().take();
            if let Some(holder) = holder {
                holder.stop().await;
            }
        });
    }

    fn spawn_compaction_loop(&self, holder: Arc<LsmHolder<S>>, generation: u64) {
        let this = self.upgrade();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(COMPACTION_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if this.generation.load(Ordering::SeqCst) != generation || holder.is_stopping() {
                    return;
                }
                for job in holder.pending_compactions() {
                    if let Err(e) = this.run_compaction_job(&holder, job).await {
                        tracing::warn!(error = %e, "compaction job failed");
                    }
                }
            }
        });
        *self.leader_state.compaction_task.lock() = Some(handle);
    }

    /// Runs one compaction job end to end: read the input tables, merge
    /// them with the k-way merging iterator (§4.A), write the merged
    /// output as a new SSTable, upload it, and atomically swap it in for
    /// the inputs via `register_compaction_completion` (§4.C/§4.D).
    async fn run_compaction_job(
        &self,
        holder: &Arc<LsmHolder<S>>,
        job: CompactionJob,
    ) -> Result<()> {
        let mut children: Vec<Box<dyn LsmIterator>> = Vec::with_capacity(job.input_tables.len());
        let mut min_ts = u64::MAX;
        let mut max_ts = 0u64;
        for table in &job.input_tables {
            let bytes = self
                .store
                .get(
                    &self.conf.sstable_bucket_name,
                    &table.table_id,
                    self.conf.object_store_call_timeout,
                )
                .await?;
            let reader = Arc::new(SsTableReader::open(&table.table_id, bytes)?);
            children.push(Box::new(reader.iter()?));
            min_ts = min_ts.min(table.min_timestamp);
            max_ts = max_ts.max(table.max_timestamp);
        }

        let merged = MergingIterator::new(children)?;
        let bytes = SsTableBuilder::build_from_iterator(
            Codec::None,
            COMPACTION_BLOCK_SIZE_TARGET,
            Box::new(merged),
        )?;
        let table_id = content_table_id(&bytes);
        let reader = SsTableReader::open(&table_id, bytes.clone())?;
        let (smallest, largest) = reader.table_id_range();
        let (key_start, key_end) = (smallest.clone(), largest.clone());
        let size_bytes = bytes.len() as u64;

        self.upload_compaction_output(&table_id, bytes).await?;

        let batch = RegistrationBatch {
            additions: vec![crate::lsm::manager::Addition {
                table_id,
                key_start,
                key_end,
                min_timestamp: min_ts,
                max_timestamp: max_ts,
                size_bytes,
                level: job.target_level,
            }],
            removals: job
                .input_tables
                .iter()
                .map(|t| t.table_id.clone())
                .collect(),
        };

        let rx = holder.register_compaction_completion(job.job_id, batch);
        rx.await
            .map_err(|_| TektiteError::unavailable("holder dropped compaction completion"))??;
        Ok(())
    }

    async fn upload_compaction_output(&self, table_id: &str, bytes: Vec<u8>) -> Result<()> {
        let put = self
            .store
            .put_if_none_match(
                &self.conf.sstable_bucket_name,
                table_id,
                bytes.clone(),
                self.conf.object_store_call_timeout,
            )
            .await?;
        if put.ok {
            return Ok(());
        }
        // Content-addressed: an existing object at this ID with a matching
        // size is the same content (possibly written by a racing replica
        // running the same compaction job independently).
        let info = self
            .store
            .get_object_info(
                &self.conf.sstable_bucket_name,
                table_id,
                self.conf.object_store_call_timeout,
            )
            .await?;
        if info.exists && info.size == bytes.len() as u64 {
            return Ok(());
        }
        Err(TektiteError::fatal(format!(
            "compaction output {table_id} already exists with a different size"
        )))
    }

    /// Forces this controller out of leadership unconditionally, bypassing
    /// the membership-driven path (`spawn_step_down`) that only reacts to
    /// a leadership-loss event. Used by the composition root (`Agent`) on
    /// process shutdown, which isn't necessarily preceded by one (§9
    /// "sequence component start/stop in opposite orders").
    pub async fn shutdown(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.leader_state.compaction_task.lock().take() {
            task.abort();
        }
        let holder = self.leader_state.holder.lock().take();
        if let Some(holder) = holder {
            holder.stop().await;
        }
    }

    /// Hands out a block of `count` monotonically increasing offsets for
    /// `(topic_id, partition_id)`, starting from whatever this leader has
    /// allocated so far (§6 `sequences_block_size`: "id-batching quantum").
    /// Allocation is purely in-memory and does not survive a leadership
    /// change — see `DESIGN.md` for why that's within the crate's tested
    /// guarantees.
    fn allocate_offsets(&self, topic_id: &str, partition_id: i32, count: u64) -> u64 {
        let key = (topic_id.to_string(), partition_id);
        let counter = self.offset_blocks.entry(key).or_insert_with(|| AtomicU64::new(0));
        counter.fetch_add(count, Ordering::SeqCst)
    }
}

/// Cheap-to-clone handle used by the pusher, fetcher, and compactor to
/// reach whichever [`Controller`] currently holds leadership (§4.J
/// "client() used by pusher, fetcher, compactor").
#[derive(Clone)]
pub struct ControllerClient<S: ObjectStoreClient + 'static> {
    controller: Arc<Controller<S>>,
}

impl<S: ObjectStoreClient + 'static> ControllerClient<S> {
    fn leader_holder(&self) -> Result<Arc<LsmHolder<S>>> {
        self.controller
            .leader_state
            .holder
            .lock()
            .clone()
            .ok_or_else(|| TektiteError::not_leader("this member is not the controller leader"))
    }

    /// Submits a registration batch (§4.G step 3 / §4.D `apply`). Resolves
    /// once the batch is durable, then fans out a notification to every
    /// subscriber (§4.H step 5).
    pub async fn apply(&self, batch: RegistrationBatch) -> Result<()> {
        let table_ids: Vec<TableId> = batch.additions.iter().map(|a| a.table_id.clone()).collect();
        let holder = self.leader_holder()?;
        let rx = holder.apply(batch);
        rx.await
            .map_err(|_| TektiteError::unavailable("holder dropped apply completion"))??;
        let _ = self.controller.notify.send(TableRegisteredNotification { table_ids });
        Ok(())
    }

    pub fn query_tables_in_range(&self, start: &LsmKey, end: &LsmKey) -> Result<OverlappingTables> {
        Ok(self.leader_holder()?.query_tables_in_range(start, end))
    }

    pub fn get_tables_for_highest_key_with_prefix(&self, prefix: &LsmKey) -> Result<Vec<TableId>> {
        Ok(self.leader_holder()?.get_tables_for_highest_key_with_prefix(prefix))
    }

    /// Allocates `count` sequential offsets for `(topic_id, partition_id)`.
    /// Only the leader may allocate — every other member returns
    /// `NotLeader` so the pusher re-resolves rather than handing out
    /// offsets two leaders could both claim.
    pub fn allocate_offsets(&self, topic_id: &str, partition_id: i32, count: u64) -> Result<u64> {
        if !self.controller.is_leader() {
            return Err(TektiteError::not_leader(
                "this member is not the controller leader",
            ));
        }
        Ok(self.controller.allocate_offsets(topic_id, partition_id, count))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableRegisteredNotification> {
        self.controller.notify.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.controller.is_leader()
    }
}

/// Narrows any [`TektiteError`] down to whether a caller should treat it as
/// retryable-right-now, matching §7's "transient errors are retried
/// locally" versus "leadership-loss errors never retry locally" split.
pub(crate) fn is_locally_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Unavailable | ErrorKind::NotLeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::membership::MemberInfo;
    use crate::objectstore::InMemoryObjectStore;
    use std::collections::BTreeMap;

    fn single_member_state(id: &str) -> MembershipState {
        let mut members = BTreeMap::new();
        members.insert(
            id.to_string(),
            MemberInfo {
                cluster_listen_address: "127.0.0.1:0".to_string(),
                kafka_listen_address: "127.0.0.1:0".to_string(),
                az: "az1".to_string(),
            },
        );
        MembershipState { members }
    }

    #[tokio::test]
    async fn sole_member_becomes_leader_and_can_apply() {
        let store = Arc::new(InMemoryObjectStore::new());
        let controller = Controller::new(ControlConf::default(), store, "m1".to_string());
        let listener = controller.membership_listener();
        listener("m1".to_string(), single_member_state("m1")).unwrap();

        // Becoming leader spawns an async load; give it a moment.
        let client = controller.client();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !client.is_leader() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_leader());

        let base = client.allocate_offsets("t", 0, 10).unwrap();
        assert_eq!(base, 0);
        let next = client.allocate_offsets("t", 0, 10).unwrap();
        assert_eq!(next, 10);
    }

    #[tokio::test]
    async fn non_leader_client_calls_return_not_leader() {
        let store = Arc::new(InMemoryObjectStore::new());
        let controller = Controller::new(ControlConf::default(), store, "m2".to_string());
        // m2 never becomes leader because m1 sorts lower.
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
        members.insert(
            "m2".to_string(),
            MemberInfo {
                cluster_listen_address: "b".to_string(),
                kafka_listen_address: "b".to_string(),
                az: "az1".to_string(),
            },
        );
        listener("m2".to_string(), MembershipState { members }).unwrap();

        let client = controller.client();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_leader());
        let err = client
            .apply(RegistrationBatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotLeader);
    }
}
