use parallel_core::{MethodId, ReqId, RpcErrorPayload};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope carrying one typed call's encoded argument, addressed to a
/// registered [`MethodId`] and tagged with a per-connection request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub req_id: ReqId,
    pub method: MethodId,
    pub payload: Vec<u8>,
}

/// Envelope carrying the result of one call, tagged with the same request
/// id so a client can demultiplex interleaved responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub req_id: ReqId,
    pub body: RpcResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponseBody {
    Ok(Vec<u8>),
    Err(RpcErrorPayload),
}

/// First message on a freshly-opened RPC connection, establishing the
/// worker-state/connection-state handshake before any user call is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOpen {
    pub protocol: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionOpenAck {
    Ready,
    ProtocolMismatch { expected: u32, actual: u32 },
    InitFailed { message: String },
}
