//! Shared ids, error taxonomy, and environment-variable contract used by
//! every crate in the parallel runtime.

pub mod address;
pub mod env;
pub mod errors;
pub mod ids;
pub mod once_slot;
pub mod time;

pub use address::WorkerAddress;
pub use errors::{ParallelError, RpcErrorKind, RpcErrorPayload, SpawnFailureReason};
pub use ids::{MethodId, ReqId, WorkerId, WorkerIdAllocator};
pub use once_slot::{AlreadySetError, OnceSlot};
pub use time::now_ms;
