//! Object-store-mediated membership: each member periodically overwrites
//! its own `member-{id}` object under `membership_bucket_name`, and
//! separately polls the full prefix to reconstruct the live set, evicting
//! entries whose heartbeat has gone stale. Unlike the master record
//! (`lsm::holder`), writes here are NOT etag-guarded — two members never
//! contend for the same sub-key, so last-writer-wins on a per-key basis is
//! sufficient (§6 "unguarded by etag").

use super::{ClusterMembership, MemberInfo, MembershipListener, MembershipState};
use crate::common::NodeId;
use crate::config::MembershipConf;
use crate::error::Result;
use crate::objectstore::ObjectStoreClient;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

const KEY_PREFIX: &str = "member-";

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct Heartbeat {
    info: MemberInfo,
    unix_millis: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct ObjectStoreMembership<S: ObjectStoreClient> {
    store: Arc<S>,
    conf: MembershipConf,
    call_timeout: Duration,
    member_id: NodeId,
    self_info: MemberInfo,
    current: Arc<SyncMutex<Option<MembershipState>>>,
    stopping: Arc<AtomicBool>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl<S: ObjectStoreClient + 'static> ObjectStoreMembership<S> {
    pub fn new(
        store: Arc<S>,
        conf: MembershipConf,
        call_timeout: Duration,
        member_id: NodeId,
        self_info: MemberInfo,
    ) -> Self {
        Self {
            store,
            conf,
            call_timeout,
            member_id,
            self_info,
            current: Arc::new(SyncMutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    async fn publish_self(&self) {
        let heartbeat = Heartbeat {
            info: self.self_info.clone(),
            unix_millis: now_millis(),
        };
        let Ok(bytes) = bincode::encode_to_vec(&heartbeat, bincode::config::standard()) else {
            return;
        };
        let key = format!("{KEY_PREFIX}{}", self.member_id);
        match self
            .store
            .put_if_none_match(&self.conf.membership_bucket_name, &key, bytes.clone(), self.call_timeout)
            .await
        {
            Ok(put) if put.ok => return,
            _ => {}
        }
        if let Ok(info) = self
            .store
            .get_object_info(&self.conf.membership_bucket_name, &key, self.call_timeout)
            .await
        {
            if info.exists {
                let _ = self
                    .store
                    .put_if_match_etag(
                        &self.conf.membership_bucket_name,
                        &key,
                        bytes,
                        &info.etag,
                        self.call_timeout,
                    )
                    .await;
            }
        }
    }

    async fn poll_once(&self) -> Result<MembershipState> {
        let keys = self
            .store
            .list_prefix(&self.conf.membership_bucket_name, KEY_PREFIX, self.call_timeout)
            .await?;
        let now = now_millis();
        let eviction_ms = self.conf.membership_eviction_interval.as_millis() as u64;
        let mut members = BTreeMap::new();
        for key in keys {
            let Ok(bytes) = self
                .store
                .get(&self.conf.membership_bucket_name, &key, self.call_timeout)
                .await
            else {
                continue;
            };
            let Ok((heartbeat, _)): std::result::Result<(Heartbeat, usize), _> =
                bincode::decode_from_slice(&bytes, bincode::config::standard())
            else {
                continue;
            };
            if now.saturating_sub(heartbeat.unix_millis) > eviction_ms {
                continue;
            }
            let Some(id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            members.insert(id.to_string(), heartbeat.info);
        }
        Ok(MembershipState { members })
    }
}

#[async_trait::async_trait]
impl<S: ObjectStoreClient + 'static> ClusterMembership for ObjectStoreMembership<S> {
    async fn start(&self, listener: MembershipListener) -> Result<()> {
        self.publish_self().await;
        let initial = self.poll_once().await?;
        *self.current.lock() = Some(initial.clone());
        listener(self.member_id.clone(), initial)?;

        let this_publish = self.clone_handles();
        let publish_interval = self.conf.membership_update_interval;
        let stopping = Arc::clone(&self.stopping);
        let publish_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(publish_interval);
            loop {
                interval.tick().await;
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
                this_publish.publish_self().await;
            }
        });

        let this_poll = self.clone_handles();
        let poll_interval = self.conf.membership_update_interval;
        let stopping = Arc::clone(&self.stopping);
        let current = self.current.lock().clone();
        let listener = Arc::new(listener);
        let member_id = self.member_id.clone();
        let poll_task = tokio::spawn(async move {
            let mut last = current;
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(state) = this_poll.poll_once().await else {
                    continue;
                };
                if Some(&state) != last.as_ref() {
                    *this_poll.current.lock() = Some(state.clone());
                    if listener(member_id.clone(), state.clone()).is_err() {
                        return;
                    }
                    last = Some(state);
                }
            }
        });

        self.tasks.lock().push(publish_task);
        self.tasks.lock().push(poll_task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn current(&self) -> Option<MembershipState> {
        self.current.lock().clone()
    }
}

/// Background tasks need their own handle to the store/conf without
/// borrowing `self` across an `'static` spawn; cheap since everything
/// inside is already `Arc`/`Clone`.
impl<S: ObjectStoreClient + 'static> ObjectStoreMembership<S> {
    fn clone_handles(&self) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::clone(&self.store),
            conf: self.conf.clone(),
            call_timeout: self.call_timeout,
            member_id: self.member_id.clone(),
            self_info: self.self_info.clone(),
            current: Arc::clone(&self.current),
            stopping: Arc::clone(&self.stopping),
            tasks: SyncMutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::InMemoryObjectStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn conf() -> MembershipConf {
        let mut c = MembershipConf::default();
        c.membership_update_interval = Duration::from_millis(5);
        c.membership_eviction_interval = Duration::from_secs(60);
        c
    }

    fn info(addr: &str) -> MemberInfo {
        MemberInfo {
            cluster_listen_address: addr.to_string(),
            kafka_listen_address: addr.to_string(),
            az: "az1".to_string(),
        }
    }

    #[tokio::test]
    async fn two_members_converge_on_each_others_presence() {
        let store = Arc::new(InMemoryObjectStore::new());
        let m1 = ObjectStoreMembership::new(
            Arc::clone(&store),
            conf(),
            Duration::from_secs(1),
            "m1".to_string(),
            info("10.0.0.1:1"),
        );
        let m2 = ObjectStoreMembership::new(
            Arc::clone(&store),
            conf(),
            Duration::from_secs(1),
            "m2".to_string(),
            info("10.0.0.2:1"),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        m1.start(Box::new(move |_id, state| {
            seen2.store(state.members.len(), Ordering::SeqCst);
            Ok(())
        }))
        .await
        .unwrap();
        m2.start(Box::new(|_id, _state| Ok(()))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        m1.stop().await.unwrap();
        m2.stop().await.unwrap();
    }
}
