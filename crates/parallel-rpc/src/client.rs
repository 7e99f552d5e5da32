use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::RpcTransportError;
use crate::message::{read_message, write_message};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin typed request/response wrapper over any duplex byte stream.
///
/// This is the transport primitive the parallel runtime's connection
/// manager builds on: it knows nothing about request ids, method
/// dispatch, or per-connection state — it only writes one framed message
/// and reads one framed message back.
pub struct RpcClient<S> {
    stream: S,
    timeout: Duration,
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the default per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one message without waiting for a reply (used for one-shot
    /// frames such as the reverse handshake and heartbeat ticks).
    pub async fn send<T: Serialize + Sync>(&mut self, value: &T) -> Result<(), RpcTransportError> {
        write_message(&mut self.stream, value).await
    }

    /// Reads one message off the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, RpcTransportError> {
        read_message(&mut self.stream).await
    }

    /// Sends a request and awaits its response within the configured timeout.
    pub async fn call<Req, Resp>(&mut self, request: &Req) -> Result<Resp, RpcTransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        timeout(self.timeout, async {
            self.send(request).await?;
            self.recv().await
        })
        .await
        .map_err(|_| RpcTransportError::Timeout)?
    }

    /// Returns the underlying stream, e.g. to hand it to a new `RpcClient`
    /// wrapping a different message type on the same connection.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Half-closes the write side of the underlying stream, so the peer's
    /// next read observes a clean EOF instead of blocking on a connection
    /// nothing will ever write to again.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
