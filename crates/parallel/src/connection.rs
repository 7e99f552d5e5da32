//! Connection Manager (§4.5): establishes and tracks client RPC
//! connections to a worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parallel_core::{MethodId, ParallelError, ReqId, RpcErrorKind, WorkerAddress};
use parallel_proto::{ConnectionOpen, ConnectionOpenAck, PROTOCOL_VERSION, RpcRequest, RpcResponse, RpcResponseBody};
use parallel_rpc::RpcClient;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// A live typed-RPC connection to a worker.
///
/// One call is in flight at a time per connection — `run` holds the
/// transport's mutex for the full write-then-read round trip, which is
/// what gives per-connection FIFO ordering "for free": the next call
/// simply cannot start writing until the previous one's response (or
/// error) has been read. This mirrors the teacher's `WorkerClient::call`,
/// generalized from one fixed request enum to any registered method.
pub struct Connection {
    transport: Mutex<RpcClient<TcpStream>>,
    next_req_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    /// Dials `address`, performs the connection-open handshake (which on
    /// the worker side synchronously runs `init_connection_state` before
    /// replying), and returns a connection ready for `run`.
    pub async fn open(address: &WorkerAddress, connect_timeout: Duration) -> Result<Self, ParallelError> {
        let stream = timeout(connect_timeout, TcpStream::connect(address.to_string()))
            .await
            .map_err(|_| ParallelError::ConnectFailed(format!("connect to {address} timed out")))?
            .map_err(|err| ParallelError::ConnectFailed(err.to_string()))?;

        let mut client = RpcClient::new(stream);
        client
            .send(&ConnectionOpen {
                protocol: PROTOCOL_VERSION,
            })
            .await
            .map_err(|err| ParallelError::ConnectFailed(err.to_string()))?;

        let ack: ConnectionOpenAck = client
            .recv()
            .await
            .map_err(|err| ParallelError::ConnectFailed(err.to_string()))?;

        match ack {
            ConnectionOpenAck::Ready => Ok(Self {
                transport: Mutex::new(client),
                next_req_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            ConnectionOpenAck::ProtocolMismatch { expected, actual } => Err(ParallelError::ConnectFailed(format!(
                "protocol mismatch: expected {expected}, got {actual}"
            ))),
            ConnectionOpenAck::InitFailed { message } => Err(ParallelError::InitConnStateFailed(message)),
        }
    }

    /// Issues one typed RPC and awaits its response.
    pub async fn run<Req, Resp>(&self, method: impl Into<MethodId>, arg: &Req) -> Result<Resp, ParallelError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ParallelError::rpc(RpcErrorKind::ConnectionClosed, "connection is closed"));
        }

        let req_id = ReqId(self.next_req_id.fetch_add(1, Ordering::Relaxed));
        let payload = serde_cbor::to_vec(arg)
            .map_err(|err| ParallelError::rpc(RpcErrorKind::Decode, format!("failed to encode argument: {err}")))?;

        let mut transport = self.transport.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ParallelError::rpc(RpcErrorKind::ConnectionClosed, "connection is closed"));
        }

        let request = RpcRequest {
            req_id,
            method: method.into(),
            payload,
        };

        transport.send(&request).await.map_err(|err| {
            self.closed.store(true, Ordering::SeqCst);
            ParallelError::rpc(RpcErrorKind::ConnectionClosed, err.to_string())
        })?;

        let response: RpcResponse = transport.recv().await.map_err(|err| {
            self.closed.store(true, Ordering::SeqCst);
            ParallelError::rpc(RpcErrorKind::ConnectionClosed, err.to_string())
        })?;

        if response.req_id != req_id {
            return Err(ParallelError::rpc(
                RpcErrorKind::Decode,
                format!("request id mismatch: expected {}, got {}", req_id.0, response.req_id.0),
            ));
        }

        match response.body {
            RpcResponseBody::Ok(bytes) => serde_cbor::from_slice(&bytes)
                .map_err(|err| ParallelError::rpc(RpcErrorKind::Decode, err.to_string())),
            RpcResponseBody::Err(payload) => Err(payload.into()),
        }
    }

    /// Marks the connection closed and half-closes the underlying socket.
    /// There is nothing left to flush once `run` already serializes every
    /// call, so `close_timeout` only bounds the shutdown syscall itself —
    /// but the shutdown is real: it signals EOF to the worker side's
    /// `read_message` loop so that side's connection task actually wakes up,
    /// runs `on_connection_close`, and drains its `ConnectionState` instead
    /// of blocking forever on a peer that merely flipped a local flag.
    pub async fn close(&self, close_timeout: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let shutdown = async {
            let mut transport = self.transport.lock().await;
            let _ = transport.shutdown().await;
        };
        if timeout(close_timeout, shutdown).await.is_err() {
            debug!(?close_timeout, "connection close grace period elapsed while shutting down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Shared, clonable handle to a [`Connection`], since a caller typically
/// wants to `run` calls on it from multiple tasks concurrently (the
/// underlying mutex still serializes them, preserving FIFO order).
pub type SharedConnection = Arc<Connection>;
