//! Membership manifold (§4.I): fans a single membership update out to an
//! ordered set of listeners, stopping at the first error, and publishes a
//! monotonically increasing `delivered_cluster_version` once every
//! listener has accepted the update.

use super::{MembershipListener, MembershipState};
use crate::common::{ClusterVersion, NodeId};
use crate::error::Result;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct MembershipManifold {
    listeners: SyncMutex<Vec<MembershipListener>>,
    delivered_cluster_version: AtomicU64,
}

impl MembershipManifold {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: SyncMutex::new(Vec::new()),
            delivered_cluster_version: AtomicU64::new(0),
        })
    }

    /// Registered listeners are invoked in the order they were added; this
    /// is the ordering §4.I's invariant depends on (e.g. the controller
    /// registering before the pusher so leadership is resolved first).
    pub fn register_listener(&self, listener: MembershipListener) {
        self.listeners.lock().push(listener);
    }

    pub fn delivered_cluster_version(&self) -> ClusterVersion {
        self.delivered_cluster_version.load(Ordering::SeqCst)
    }

    /// Wraps this manifold as a single [`MembershipListener`], suitable to
    /// hand to [`super::ClusterMembership::start`]. The provider only ever
    /// calls its listener from one task at a time, so delivery to every
    /// registered sub-listener here is already serialized per member.
    pub fn as_listener(self: &Arc<Self>) -> MembershipListener {
        let this = Arc::clone(self);
        Box::new(move |member_id, state| this.dispatch(member_id, state))
    }

    fn dispatch(&self, member_id: NodeId, state: MembershipState) -> Result<()> {
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener(member_id.clone(), state.clone())?;
        }
        drop(listeners);
        self.delivered_cluster_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TektiteError;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn empty_state() -> MembershipState {
        MembershipState::default()
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let manifold = MembershipManifold::new();
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        manifold.register_listener(Box::new(move |_, _| {
            o1.lock().push(1);
            Ok(())
        }));
        let o2 = Arc::clone(&order);
        manifold.register_listener(Box::new(move |_, _| {
            o2.lock().push(2);
            Ok(())
        }));

        let listener = manifold.as_listener();
        listener("m1".to_string(), empty_state()).unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(manifold.delivered_cluster_version(), 1);
    }

    #[test]
    fn first_error_stops_delivery_and_is_returned() {
        let manifold = MembershipManifold::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&calls);
        manifold.register_listener(Box::new(move |_, _| {
            c1.fetch_add(1, AtomicOrdering::SeqCst);
            Err(TektiteError::unavailable("listener one failed"))
        }));
        let c2 = Arc::clone(&calls);
        manifold.register_listener(Box::new(move |_, _| {
            c2.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }));

        let listener = manifold.as_listener();
        let result = listener("m1".to_string(), empty_state());
        assert!(result.is_err());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(manifold.delivered_cluster_version(), 0);
    }
}
