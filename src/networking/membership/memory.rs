//! In-memory membership fake: a shared, test-driven roster with no object
//! store involved. `set_members` lets a test push a new view directly and
//! synchronously invoke the listener, which is all the fake needs to
//! stand in for [`super::ObjectStoreMembership`] in unit tests elsewhere.

use super::{ClusterMembership, MembershipListener, MembershipState};
use crate::common::NodeId;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct InMemoryMembership {
    member_id: NodeId,
    current: Mutex<Option<MembershipState>>,
    listener: Mutex<Option<MembershipListener>>,
}

impl InMemoryMembership {
    pub fn new(member_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            member_id,
            current: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    /// Publishes a new membership view, invoking the registered listener
    /// synchronously (tests don't need to race a background task).
    pub fn set_members(&self, state: MembershipState) -> Result<()> {
        *self.current.lock() = Some(state.clone());
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(self.member_id.clone(), state)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterMembership for InMemoryMembership {
    async fn start(&self, listener: MembershipListener) -> Result<()> {
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.listener.lock() = None;
        Ok(())
    }

    fn current(&self) -> Option<MembershipState> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::membership::MemberInfo;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn set_members_invokes_the_registered_listener() {
        let membership = InMemoryMembership::new("m1".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        membership
            .start(Box::new(move |_id, _state| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();

        let mut members = BTreeMap::new();
        members.insert(
            "m2".to_string(),
            MemberInfo {
                cluster_listen_address: "10.0.0.2:1".to_string(),
                kafka_listen_address: "10.0.0.2:2".to_string(),
                az: "az1".to_string(),
            },
        );
        membership.set_members(MembershipState { members }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(membership.current().unwrap().members.len(), 1);
    }
}
