use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an RPC failure, serialized across the wire so a client
/// can distinguish transport trouble from a handler-raised exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    /// The connection was closed while the call was outstanding.
    ConnectionClosed,
    /// The wire payload could not be decoded into the expected type.
    Decode,
    /// No handler is registered for the requested method id.
    UnknownMethod,
    /// The registered handler returned an error.
    RemoteException,
    /// The registered handler's own task panicked before producing a result.
    HandlerPanicked,
    /// The call did not complete before its timeout.
    Timeout,
}

/// Wire payload for a failed RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub kind: RpcErrorKind,
    pub message: String,
}

/// Why a spawn never completed its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailureReason {
    /// No reverse-handshake frame arrived within the spawn timeout.
    HandshakeTimeout,
    /// The handshake cookie did not match the one generated for this spawn.
    CookieMismatch,
    /// The worker's binary hash differs from the master's.
    BinaryMismatch { expected: String, actual: String },
    /// The child process exited before completing its handshake.
    ChildExited { status: Option<i32> },
    /// Launching the child process failed outright.
    Io(String),
}

impl std::fmt::Display for SpawnFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
            Self::CookieMismatch => write!(f, "handshake cookie mismatch"),
            Self::BinaryMismatch { expected, actual } => {
                write!(f, "binary hash mismatch: expected {expected}, got {actual}")
            }
            Self::ChildExited { status } => write!(f, "child exited before handshake: {status:?}"),
            Self::Io(detail) => write!(f, "io error: {detail}"),
        }
    }
}

/// Top-level error taxonomy for the parallel runtime.
#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("invalid {PARALLEL_ROLE_VAR} value: {0}")]
    EnvInvalid(String),
    #[error("extra environment variable overrides a reserved key: {0}")]
    ReservedEnvKey(String),
    #[error("could not locate current executable: {0}")]
    BinaryNotLocatable(String),
    #[error("could not read current executable: {0}")]
    BinaryReadFailed(String),
    #[error("binary mismatch: expected {expected}, got {actual}")]
    BinaryMismatch { expected: String, actual: String },
    #[error("spawn failed: {0}")]
    SpawnFailed(SpawnFailureReason),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("init_connection_state failed: {0}")]
    InitConnStateFailed(String),
    #[error("rpc error ({kind:?}): {message}")]
    Rpc {
        kind: RpcErrorKind,
        message: String,
    },
    #[error("heartbeat lost")]
    HeartbeatLost,
    #[error("late task failure: {0}")]
    LateTaskFailure(String),
}

impl ParallelError {
    pub fn rpc(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self::Rpc {
            kind,
            message: message.into(),
        }
    }
}

impl From<RpcErrorPayload> for ParallelError {
    fn from(payload: RpcErrorPayload) -> Self {
        ParallelError::Rpc {
            kind: payload.kind,
            message: payload.message,
        }
    }
}

use crate::env::PARALLEL_ROLE_VAR;
