//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection closed in the middle of a frame
    #[error("Connection closed with {buffered} bytes of an incomplete frame buffered")]
    TruncatedFrame { buffered: usize },

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Declared frame length is negative
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(i32),

    /// Declared frame length exceeds the configured maximum
    #[error("Frame payload of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// Timeout waiting for the peer
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// The coordinator refused the handshake
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Transport not connected
    #[error("Transport not connected")]
    NotConnected,
}

impl IpcError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::IoError(_) | IpcError::Timeout(_))
    }

    /// Check if this error indicates a violated protocol contract
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ProtocolVersionMismatch { .. }
                | IpcError::InvalidMessage(_)
                | IpcError::InvalidFrameLength(_)
                | IpcError::FrameTooLarge { .. }
                | IpcError::HandshakeRejected(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => IpcError::ConnectionClosed,
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
