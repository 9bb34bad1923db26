//! In-process transport: a "connection" is a direct call into the target
//! transport's handler table, with no actual bytes on a wire. Used by
//! tests and by a single-node `Agent`, where every peer the controller
//! talks to is this same process (§6 "Transport").

use super::{Connection, ConnectionFactory, Handler, HandlerId, Transport};
use crate::error::{Result, TektiteError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct MemoryTransport {
    handlers: DashMap<HandlerId, Handler>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// A connection that dispatches directly into this transport's handler
    /// table, as if the two ends were on the same node.
    pub fn local_connection(self: &Arc<Self>) -> Arc<dyn Connection> {
        Arc::new(MemoryConnection {
            target: Arc::clone(self),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn register_handler(&self, id: HandlerId, handler: Handler) {
        self.handlers.insert(id, handler);
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryConnectionFactory {
    target: Arc<MemoryTransport>,
}

impl MemoryConnectionFactory {
    pub fn new(target: Arc<MemoryTransport>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    type Address = ();

    async fn connect(&self, _addr: &()) -> Result<Arc<dyn Connection>> {
        Ok(self.target.local_connection())
    }
}

struct MemoryConnection {
    target: Arc<MemoryTransport>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn call(&self, handler: HandlerId, payload: Vec<u8>) -> Result<Vec<u8>> {
        let handler_fn = self
            .target
            .handlers
            .get(&handler)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                TektiteError::not_found(format!("no handler registered for {handler:?}"))
            })?;
        handler_fn(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_directly_to_the_registered_handler() {
        let transport = MemoryTransport::new();
        transport.register_handler(
            HandlerId::FetcherTableRegisteredNotification,
            Arc::new(|payload| Box::pin(async move { Ok(payload) })),
        );
        let conn = transport.local_connection();
        let response = conn
            .call(HandlerId::FetcherTableRegisteredNotification, b"t1".to_vec())
            .await
            .unwrap();
        assert_eq!(response, b"t1");
    }

    #[tokio::test]
    async fn unregistered_handler_is_not_found() {
        let transport = MemoryTransport::new();
        let conn = transport.local_connection();
        let err = conn
            .call(HandlerId::MetaLocalCacheTopicDeleted, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::NotFound));
    }
}
