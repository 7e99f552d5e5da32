use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{decode, encode};
use crate::framing::{read_frame, write_frame};
use crate::RpcTransportError;

/// Encodes and writes one typed message as a single length-prefixed frame.
///
/// Used for every message shape in the runtime — handshake frames,
/// heartbeat ticks, and RPC request/response envelopes alike — so framing
/// and encoding stay in one place regardless of which wire message crosses.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), RpcTransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(value)?;
    write_frame(writer, &payload).await
}

/// Reads and decodes one typed message from a single length-prefixed frame.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, RpcTransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?;
    decode(&frame)
}
