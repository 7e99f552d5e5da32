//! Async length-prefixed CBOR transport used by the parallel runtime.
//!
//! Generic over the wire message type on purpose: the same framing and
//! codec carry the reverse-handshake frame, the heartbeat tick, and the
//! multiplexed RPC envelope defined in `parallel-proto`.

mod error;

pub mod client;
pub mod codec;
pub mod framing;
pub mod message;

pub use client::RpcClient;
pub use error::RpcTransportError;
pub use message::{read_message, write_message};
