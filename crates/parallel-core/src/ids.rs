use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque globally-unique id assigned to a worker by its spawning master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic allocator for fresh [`WorkerId`]s, one per master process.
#[derive(Debug, Default)]
pub struct WorkerIdAllocator {
    next: AtomicU64,
}

impl WorkerIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocates the next id in the sequence. Safe to call concurrently.
    pub fn allocate(&self) -> WorkerId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        WorkerId(format!("worker-{n}"))
    }
}

/// Per-request id assigned by a connection's caller side, unique within that
/// connection and reused on the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReqId(pub u64);

/// Identifies a registered RPC handler within a worker's function registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub String);

impl From<&str> for MethodId {
    fn from(value: &str) -> Self {
        MethodId(value.to_string())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
