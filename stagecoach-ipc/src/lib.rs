//! Inter-process communication for Stagecoach
//!
//! This crate provides the wire format used between the coordinator and
//! the worker processes: the length-prefixed frame with its trailing
//! generation token, the fixed-size discovery handshake, the protocol
//! messages, and the worker-side transports.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use codec::{
    encode_frame, encode_message, read_frame, termination_frame, Frame, FrameBuffer,
    DEFAULT_MAX_PAYLOAD_LEN,
};
pub use error::IpcError;
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use protocol::{CoordinatorCommand, MessageEnvelope, WorkerReply, IPC_PROTOCOL_VERSION};
pub use transport::{ChannelEndpoint, ChannelTransport, TcpWorkerTransport, WorkerTransport};
