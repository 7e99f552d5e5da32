use parallel_core::WorkerId;
use serde::{Deserialize, Serialize};

/// One-shot frame a freshly-spawned child sends to its parent's reverse
/// handshake listener, publishing its RPC server address and identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeFrame {
    pub worker_id: WorkerId,
    pub host: String,
    pub port: u16,
    pub binary_md5: [u8; 16],
    pub cookie: String,
}

/// Parent's reply, confirming (or rejecting) the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeAck {
    Accepted,
    Rejected { reason: String },
}
