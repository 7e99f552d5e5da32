use serde::{Deserialize, Serialize};

/// Bidirectional liveness frame exchanged every `interval` on a worker's
/// dedicated heartbeat connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeartbeatFrame {
    Tick { seq: u64 },
    Shutdown { seq: u64 },
}

impl HeartbeatFrame {
    pub fn seq(&self) -> u64 {
        match self {
            HeartbeatFrame::Tick { seq } | HeartbeatFrame::Shutdown { seq } => *seq,
        }
    }
}
