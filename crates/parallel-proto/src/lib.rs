//! Wire message shapes for the parallel runtime: the reverse-handshake
//! frame, the heartbeat frame, and the multiplexed RPC envelope.
//!
//! These types describe *what* crosses the wire; the framing and encoding
//! used to put them there lives in `parallel-rpc`.

pub mod handshake;
pub mod heartbeat;
pub mod rpc;

pub use handshake::{HandshakeAck, HandshakeFrame};
pub use heartbeat::HeartbeatFrame;
pub use rpc::{ConnectionOpen, ConnectionOpenAck, RpcRequest, RpcResponse, RpcResponseBody, PROTOCOL_VERSION};
