//! Connection-oriented RPC transport with typed handler IDs (§6
//! "Transport"). Two implementations ship: [`tcp::TcpTransport`]
//! (length-prefixed `bincode` framing over `tokio::net::TcpStream`) and
//! [`memory::MemoryTransport`] (in-process, used by tests and by a
//! single-node `Agent` where every peer is local).

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The handler IDs every transport implementation must be able to route.
/// Registered at `start`; a handler not yet registered answers `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum HandlerId {
    TablePusherDirectWrite,
    TablePusherDirectProduce,
    FetcherTableRegisteredNotification,
    MetaLocalCacheTopicAdded,
    MetaLocalCacheTopicDeleted,
}

/// A registered handler: takes the raw request payload, returns the raw
/// response payload or an error to propagate back to the caller.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// One established, reusable channel to a peer.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn call(&self, handler: HandlerId, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Establishes connections to peers, one per distinct peer address.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Address: Send + Sync;

    async fn connect(&self, addr: &Self::Address) -> Result<Arc<dyn Connection>>;
}

/// The server side: registers handlers, then serves them until `stop`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn register_handler(&self, id: HandlerId, handler: Handler);
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}
