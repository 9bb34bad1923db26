//! Cluster membership (§6 "Cluster membership"): a pluggable provider that
//! exposes `start`/`stop` and invokes a single listener callback per change
//! with `(this_member_id, membership_state)`. The object-store-mediated
//! implementation round-trips a membership-state object the way the LSM
//! holder (`lsm::holder`) round-trips the master record, but unguarded by
//! etag — last writer wins on a per-member sub-key, since membership
//! itself isn't the thing under CAS-protected consensus here (the master
//! record is).

pub mod manifold;
pub mod memory;
pub mod objectstore;

pub use manifold::MembershipManifold;
pub use memory::InMemoryMembership;
pub use objectstore::ObjectStoreMembership;

use crate::common::NodeId;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One member's self-reported address payload (§6 "Membership data
/// payload").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MemberInfo {
    pub cluster_listen_address: String,
    pub kafka_listen_address: String,
    pub az: String,
}

/// The full membership snapshot: every live member's self-reported info,
/// keyed by member id. A `BTreeMap` so two nodes that independently
/// computed the same membership serialize to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MembershipState {
    pub members: BTreeMap<NodeId, MemberInfo>,
}

impl MembershipState {
    pub fn is_member(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn live_member_ids(&self) -> Vec<NodeId> {
        self.members.keys().cloned().collect()
    }
}

/// Invoked once per membership change, with this node's own id and the new
/// state. Implementations may suspend; the provider serializes calls.
pub type MembershipListener = Box<dyn Fn(NodeId, MembershipState) -> Result<()> + Send + Sync>;

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Registers `listener` and begins publishing this member into, and
    /// polling updates from, the membership provider.
    async fn start(&self, listener: MembershipListener) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// The most recent snapshot this provider has observed, if `start` has
    /// run at least once.
    fn current(&self) -> Option<MembershipState>;
}
