//! LSM metadata custodian (§4.D): queues registration batches, persists the
//! master record on a fixed cadence under etag guard, and self-demotes the
//! instant it loses the CAS race.
//!
//! Grounded directly on `lsm_holder.go`: the flush path snapshots bytes
//! under lock, releases the lock, issues the conditional put, then
//! re-acquires only to record the new etag (or the terminal "stopping"
//! state) and fire completions — completions always run outside the lock
//! so a downstream cache that also locks can't deadlock with the holder
//! (§4.D "Locking discipline").

use crate::common::TableId;
use crate::config::ControlConf;
use crate::error::{Result, TektiteError};
use crate::lsm::manager::{CompactionJob, LsmManager, MasterRecord, OverlappingTables, RegistrationBatch};
use crate::objectstore::ObjectStoreClient;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// What a caller submitting a batch gets back once the holder knows
/// whether (and when) it became durable.
pub type Completion = oneshot::Sender<Result<()>>;

/// Fixed level count for the in-memory tree. The spec doesn't bound this;
/// seven levels keeps the exponential size-tiering headroom a real
/// deployment would want without adding a config knob nothing else reads.
const DEFAULT_NUM_LEVELS: usize = 7;

struct HolderState {
    manager: LsmManager,
    etag: Option<String>,
    /// Completions for batches already applied to `manager` but not yet
    /// known-durable.
    waiting: Vec<Completion>,
    /// Batches rejected by L0 admission, to be retried once compaction
    /// frees space. FIFO order per §8 "Boundary behaviors".
    queued: VecDeque<(RegistrationBatch, Completion)>,
}

/// Wraps the in-memory [`LsmManager`] with admission control and periodic,
/// etag-guarded persistence (§4.D).
pub struct LsmHolder<S: ObjectStoreClient + 'static> {
    state: Arc<SyncMutex<HolderState>>,
    store: Arc<S>,
    conf: ControlConf,
    stopping: Arc<AtomicBool>,
    flush_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl<S: ObjectStoreClient + 'static> LsmHolder<S> {
    /// Fetches the master record from the object store (if any) and
    /// constructs a holder ready to `start()`. Retries `Unavailable`
    /// fetches with a 100ms backoff, per §4.D "load_metadata at start".
    pub async fn load(store: Arc<S>, conf: ControlConf) -> Result<Self> {
        let stopping = Arc::new(AtomicBool::new(false));
        loop {
            if stopping.load(Ordering::SeqCst) {
                return Err(TektiteError::unavailable("holder stopped during load"));
            }
            let info = store
                .get_object_info(
                    &conf.controller_metadata_bucket_name,
                    &conf.controller_metadata_key,
                    conf.object_store_call_timeout,
                )
                .await;
            match info {
                Ok(info) if !info.exists => {
                    let l0_max = conf.l0_max_tables;
                    return Ok(Self::new_with(
                        store,
                        conf,
                        LsmManager::new(l0_max, DEFAULT_NUM_LEVELS),
                        None,
                        stopping,
                    ));
                }
                Ok(info) => {
                    let bytes = store
                        .get(
                            &conf.controller_metadata_bucket_name,
                            &conf.controller_metadata_key,
                            conf.object_store_call_timeout,
                        )
                        .await?;
                    let (record, _): (MasterRecord, usize) =
                        bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                    let manager = LsmManager::from_master_record(record, conf.l0_max_tables);
                    return Ok(Self::new_with(store, conf, manager, Some(info.etag), stopping));
                }
                Err(e) if e.is_retryable() => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn new_with(
        store: Arc<S>,
        conf: ControlConf,
        manager: LsmManager,
        etag: Option<String>,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: Arc::new(SyncMutex::new(HolderState {
                manager,
                etag,
                waiting: Vec::new(),
                queued: VecDeque::new(),
            })),
            store,
            conf,
            stopping,
            flush_task: SyncMutex::new(None),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Starts the periodic flush task (§4.D "periodic flush timer").
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.conf.lsm_state_write_interval);
            loop {
                interval.tick().await;
                if this.stopping.load(Ordering::SeqCst) {
                    break;
                }
                this.flush_once().await;
            }
        });
        *self.flush_task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        // Anyone still waiting on durability when we're asked to stop gets
        // an Unavailable rather than hanging forever.
        let waiting: Vec<Completion> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.waiting)
        };
        for tx in waiting {
            let _ = tx.send(Err(TektiteError::unavailable("holder stopped")));
        }
    }

    /// Submits a registration batch (§4.D `apply`). The returned receiver
    /// resolves once the batch's effect is durable (or the holder
    /// determines it never will be).
    pub fn apply(&self, batch: RegistrationBatch) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        if self.stopping.load(Ordering::SeqCst) {
            let _ = tx.send(Err(TektiteError::unavailable("holder is stopping")));
            return rx;
        }
        let mut state = self.state.lock();
        match state.manager.apply_changes(&batch, false) {
            Ok(true) => state.waiting.push(tx),
            Ok(false) => state.queued.push_back((batch, tx)),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
        rx
    }

    pub fn register_compaction_completion(
        &self,
        job_id: u64,
        batch: RegistrationBatch,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        if self.stopping.load(Ordering::SeqCst) {
            let _ = tx.send(Err(TektiteError::unavailable("holder is stopping")));
            return rx;
        }
        let mut state = self.state.lock();
        match state.manager.register_compaction_completion(job_id, &batch) {
            Ok(_) => state.waiting.push(tx),
            Err(e) => {
                let _ = tx.send(Err(e));
                return rx;
            }
        }
        self.retry_queued(&mut state);
        rx
    }

    pub fn query_tables_in_range(
        &self,
        start: &crate::lsm::key::LsmKey,
        end: &crate::lsm::key::LsmKey,
    ) -> OverlappingTables {
        self.state.lock().manager.query_tables_in_range(start, end)
    }

    pub fn get_tables_for_highest_key_with_prefix(
        &self,
        prefix: &crate::lsm::key::LsmKey,
    ) -> Vec<TableId> {
        self.state
            .lock()
            .manager
            .get_tables_for_highest_key_with_prefix(prefix)
    }

    pub fn pending_compactions(&self) -> Vec<CompactionJob> {
        self.state.lock().manager.pending_compactions()
    }

    /// Retries queued (L0-backpressured) batches FIFO once space may have
    /// opened up — called after every compaction completion (§4.D
    /// "Queued entries are retried by `maybe_retry_applies`").
    fn retry_queued(&self, state: &mut HolderState) {
        while let Some((batch, tx)) = state.queued.pop_front() {
            match state.manager.apply_changes(&batch, false) {
                Ok(true) => state.waiting.push(tx),
                Ok(false) => {
                    state.queued.push_front((batch, tx));
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        }
    }

    async fn flush_once(&self) {
        let (bytes, completions, first_write) = {
            let mut state = self.state.lock();
            if state.waiting.is_empty() {
                return;
            }
            let record = state.manager.to_master_record();
            let bytes = match bincode::encode_to_vec(&record, bincode::config::standard()) {
                Ok(b) => b,
                Err(e) => {
                    let msg = e.to_string();
                    let completions = std::mem::take(&mut state.waiting);
                    drop(state);
                    for tx in completions {
                        let _ = tx.send(Err(TektiteError::fatal(format!(
                            "failed to encode master record: {msg}"
                        ))));
                    }
                    return;
                }
            };
            let completions = std::mem::take(&mut state.waiting);
            (bytes, completions, state.etag.is_none())
        };

        let result = if first_write {
            self.store
                .put_if_none_match(
                    &self.conf.controller_metadata_bucket_name,
                    &self.conf.controller_metadata_key,
                    bytes,
                    self.conf.object_store_call_timeout,
                )
                .await
        } else {
            let etag = { self.state.lock().etag.clone().unwrap_or_default() };
            self.store
                .put_if_match_etag(
                    &self.conf.controller_metadata_bucket_name,
                    &self.conf.controller_metadata_key,
                    bytes,
                    &etag,
                    self.conf.object_store_call_timeout,
                )
                .await
        };

        match result {
            Ok(put) if put.ok => {
                self.state.lock().etag = Some(put.etag);
                for tx in completions {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(_) => {
                // Lost the CAS race with no transport error: superseded.
                self.stopping.store(true, Ordering::SeqCst);
                for tx in completions {
                    let _ = tx.send(Err(TektiteError::unavailable(
                        "lost leadership: master record etag superseded",
                    )));
                }
            }
            Err(e) if e.is_retryable() => {
                // Transient: put the completions back for the next tick.
                // Their batches are still reflected in the manager, so a
                // later snapshot will include them again.
                let mut state = self.state.lock();
                let mut restored = completions;
                restored.append(&mut state.waiting);
                state.waiting = restored;
            }
            Err(e) => {
                self.stopping.store(true, Ordering::SeqCst);
                for tx in completions {
                    let _ = tx.send(Err(e.reclassify()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::key::LsmKey;
    use crate::lsm::manager::Addition;
    use crate::objectstore::InMemoryObjectStore;
    use std::time::Duration;

    fn test_conf() -> ControlConf {
        let mut c = ControlConf::default();
        c.lsm_state_write_interval = Duration::from_millis(5);
        c
    }

    fn addition(id: &str) -> Addition {
        Addition {
            table_id: id.to_string(),
            key_start: LsmKey::new(vec![0]),
            key_end: LsmKey::new(vec![10]),
            min_timestamp: 0,
            max_timestamp: 0,
            size_bytes: 10,
            level: 0,
        }
    }

    #[tokio::test]
    async fn apply_then_flush_resolves_completion() {
        let store = Arc::new(InMemoryObjectStore::new());
        let holder = Arc::new(LsmHolder::load(store, test_conf()).await.unwrap());
        holder.start();
        let rx = holder.apply(RegistrationBatch {
            additions: vec![addition("t1")],
            removals: vec![],
        });
        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("completion should fire")
            .unwrap();
        assert!(result.is_ok());
        holder.stop().await;
    }

    #[tokio::test]
    async fn etag_mismatch_stops_holder_and_fails_pending_completions() {
        let store = Arc::new(InMemoryObjectStore::new());
        let holder = Arc::new(LsmHolder::load(store.clone(), test_conf()).await.unwrap());
        holder.start();
        let rx1 = holder.apply(RegistrationBatch {
            additions: vec![addition("t1")],
            removals: vec![],
        });
        tokio::time::timeout(Duration::from_secs(1), rx1)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // External writer steals the master record key from under us.
        store
            .delete(
                &test_conf().controller_metadata_bucket_name,
                &test_conf().controller_metadata_key,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        store
            .put_if_none_match(
                &test_conf().controller_metadata_bucket_name,
                &test_conf().controller_metadata_key,
                b"external".to_vec(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let rx2 = holder.apply(RegistrationBatch {
            additions: vec![addition("t2")],
            removals: vec![],
        });
        let result = tokio::time::timeout(Duration::from_secs(1), rx2)
            .await
            .expect("completion should fire")
            .unwrap();
        assert!(result.is_err());
        assert!(holder.is_stopping());
    }
}
