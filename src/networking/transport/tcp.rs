//! TCP implementation of the RPC transport: one `bincode`-framed
//! request/response per `call`, each frame prefixed with a big-endian
//! `u32` byte length.

use super::{Connection, ConnectionFactory, Handler, HandlerId, Transport};
use crate::error::{ErrorKind, Result, TektiteError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct Frame {
    handler: HandlerId,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
enum WireErrorKind {
    Unavailable,
    NotLeader,
    CorruptTable,
    InvalidArgument,
    NotFound,
    Fatal,
}

impl From<ErrorKind> for WireErrorKind {
    fn from(k: ErrorKind) -> Self {
        match k {
            ErrorKind::Unavailable => Self::Unavailable,
            ErrorKind::NotLeader => Self::NotLeader,
            ErrorKind::CorruptTable => Self::CorruptTable,
            ErrorKind::InvalidArgument => Self::InvalidArgument,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Fatal => Self::Fatal,
        }
    }
}

impl WireErrorKind {
    fn into_error(self, message: String) -> TektiteError {
        match self {
            Self::Unavailable => TektiteError::unavailable(message),
            Self::NotLeader => TektiteError::not_leader(message),
            Self::CorruptTable => TektiteError::corrupt_table("<remote>", message),
            Self::InvalidArgument => TektiteError::invalid_argument(message),
            Self::NotFound => TektiteError::not_found(message),
            Self::Fatal => TektiteError::fatal(message),
        }
    }
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
enum WireResult {
    Ok(Vec<u8>),
    Err(WireErrorKind, String),
}

async fn write_framed<T: bincode::Encode>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = bincode::encode_to_vec(value, bincode::config::standard())?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| TektiteError::invalid_argument("frame too large to encode"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_framed<T: bincode::Decode<()>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(TektiteError::invalid_argument("frame exceeds size limit"));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    let (value, _) = bincode::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(value)
}

/// Server + client RPC endpoint bound to a single local TCP address.
pub struct TcpTransport {
    local_addr: SocketAddr,
    handlers: Arc<DashMap<HandlerId, Handler>>,
    accept_task: SyncMutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            handlers: Arc::new(DashMap::new()),
            accept_task: SyncMutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn serve_connection(mut stream: TcpStream, handlers: Arc<DashMap<HandlerId, Handler>>) {
        loop {
            let frame: Frame = match read_framed(&mut stream).await {
                Ok(f) => f,
                Err(_) => return,
            };
            let result = match handlers.get(&frame.handler) {
                Some(h) => match h.clone()(frame.payload).await {
                    Ok(bytes) => WireResult::Ok(bytes),
                    Err(e) => WireResult::Err(e.kind().into(), e.to_string()),
                },
                None => WireResult::Err(
                    WireErrorKind::NotFound,
                    format!("no handler registered for {:?}", frame.handler),
                ),
            };
            if write_framed(&mut stream, &result).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn register_handler(&self, id: HandlerId, handler: Handler) {
        self.handlers.insert(id, handler);
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.local_addr).await?;
        let handlers = Arc::clone(&self.handlers);
        let stopping = Arc::clone(&self.stopping);
        let handle = tokio::spawn(async move {
            loop {
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let handlers = Arc::clone(&handlers);
                        tokio::spawn(Self::serve_connection(stream, handlers));
                    }
                    Err(e) => {
                        tracing::warn!("tcp accept failed: {e}");
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

pub struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    type Address = SocketAddr;

    async fn connect(&self, addr: &SocketAddr) -> Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Arc::new(TcpConnection {
            stream: AsyncMutex::new(stream),
        }))
    }
}

pub struct TcpConnection {
    stream: AsyncMutex<TcpStream>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn call(&self, handler: HandlerId, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        write_framed(&mut stream, &Frame { handler, payload }).await?;
        match read_framed(&mut stream).await? {
            WireResult::Ok(bytes) => Ok(bytes),
            WireResult::Err(kind, message) => Err(kind.into_error(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trips_a_call_through_a_registered_handler() {
        // Bind an ephemeral port first so the transport can be constructed
        // with a concrete address.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = TcpTransport::new(addr);
        transport.register_handler(
            HandlerId::TablePusherDirectWrite,
            Arc::new(|payload: Vec<u8>| {
                Box::pin(async move {
                    let mut echoed = payload;
                    echoed.push(b'!');
                    Ok(echoed)
                })
            }),
        );
        transport.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let factory = TcpConnectionFactory;
        let conn = factory.connect(&addr).await.unwrap();
        let response = conn
            .call(HandlerId::TablePusherDirectWrite, b"hi".to_vec())
            .await
            .unwrap();
        assert_eq!(response, b"hi!");
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_handler_returns_not_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = TcpTransport::new(addr);
        transport.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let factory = TcpConnectionFactory;
        let conn = factory.connect(&addr).await.unwrap();
        let err = conn
            .call(HandlerId::MetaLocalCacheTopicAdded, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        transport.stop().await.unwrap();
    }
}
