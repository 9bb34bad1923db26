//! Everything the rest of the crate needs to talk to other members of the
//! cluster: a connection-oriented RPC [`transport`] and an
//! object-store-mediated [`membership`] provider with a fan-out
//! [`membership::MembershipManifold`] in front of it.

pub mod membership;
pub mod transport;

pub use membership::{ClusterMembership, MemberInfo, MembershipManifold, MembershipState};
pub use transport::{Connection, ConnectionFactory, Handler, HandlerId, Transport};
