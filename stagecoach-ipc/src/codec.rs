//! Length-prefixed framing with a trailing generation token
//!
//! Wire layout of every application frame:
//!
//! ```text
//! [length: i32 BE][payload: length bytes][generation token: 16 bytes]
//! ```
//!
//! A frame with `length == 0` and an all-zero token tells the worker the
//! run is over.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use stagecoach_core::GenerationToken;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Size of the length prefix
pub const LENGTH_FIELD_LEN: usize = 4;
/// Size of the trailing generation token
pub const TOKEN_LEN: usize = GenerationToken::LEN;
/// Bytes a frame occupies besides its payload
pub const FRAME_OVERHEAD: usize = LENGTH_FIELD_LEN + TOKEN_LEN;
/// Largest payload accepted unless configured otherwise
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub token: GenerationToken,
}

impl Frame {
    /// Empty payload with an all-zero token: the coordinator is shutting the run down
    pub fn is_termination(&self) -> bool {
        self.payload.is_empty() && self.token.is_first()
    }

    /// Decode the payload as an enveloped message
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        let envelope: MessageEnvelope<T> = serde_json::from_slice(&self.payload)
            .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

        if envelope.protocol_version != IPC_PROTOCOL_VERSION {
            return Err(IpcError::ProtocolVersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: envelope.protocol_version,
            });
        }

        Ok(envelope.message)
    }
}

/// Encode raw payload bytes into a frame
pub fn encode_frame(payload: &[u8], token: GenerationToken) -> Result<Bytes, IpcError> {
    let length = i32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
        length: payload.len(),
        max: i32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_i32(length);
    buf.put_slice(payload);
    buf.put_slice(&token.to_bytes());
    Ok(buf.freeze())
}

/// Wrap a message in an envelope, serialize it and encode it into a frame
pub fn encode_message<T: Serialize>(message: T, token: GenerationToken) -> Result<Bytes, IpcError> {
    let payload = serde_json::to_vec(&MessageEnvelope::new(message))
        .map_err(|e| IpcError::SerializationError(e.to_string()))?;
    encode_frame(&payload, token)
}

/// The run-termination frame
pub fn termination_frame() -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD);
    buf.put_i32(0);
    buf.put_slice(&GenerationToken::first().to_bytes());
    buf.freeze()
}

/// Growable receive buffer accumulating one frame at a time
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl FrameBuffer {
    pub fn new(max_payload_len: usize) -> Self {
        Self::with_capacity(INITIAL_BUFFER_CAPACITY, max_payload_len)
    }

    pub fn with_capacity(capacity: usize, max_payload_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            max_payload_len,
        }
    }

    /// Bytes buffered so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Append received bytes
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Payload length declared by the buffered header, once it is complete
    fn declared_length(&self) -> Result<Option<usize>, IpcError> {
        if self.buf.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let raw = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if raw < 0 {
            return Err(IpcError::InvalidFrameLength(raw));
        }
        let length = raw as usize;
        if length > self.max_payload_len {
            return Err(IpcError::FrameTooLarge {
                length,
                max: self.max_payload_len,
            });
        }
        Ok(Some(length))
    }

    /// Grow the buffer so the frame being received fits.
    ///
    /// Capacity doubles, or jumps straight to the required size when
    /// doubling is not enough.
    pub fn ensure_capacity(&mut self) -> Result<(), IpcError> {
        let required = match self.declared_length()? {
            Some(length) => length + FRAME_OVERHEAD,
            None => LENGTH_FIELD_LEN,
        };
        let capacity = self.buf.capacity();
        if capacity < required || self.buf.len() == capacity {
            let target = std::cmp::max(capacity * 2, required);
            self.buf.reserve(target - self.buf.len());
        }
        Ok(())
    }

    /// Extract the next complete frame, if one is buffered
    pub fn try_decode(&mut self) -> Result<Option<Frame>, IpcError> {
        let length = match self.declared_length()? {
            Some(length) => length,
            None => return Ok(None),
        };
        let total = length + FRAME_OVERHEAD;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf.split_to(total).freeze();
        let payload = frame.slice(LENGTH_FIELD_LEN..LENGTH_FIELD_LEN + length);
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&frame[total - TOKEN_LEN..]);

        Ok(Some(Frame {
            payload,
            token: GenerationToken::from_bytes(token),
        }))
    }

    fn spare(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Read from `reader` until one complete frame is buffered.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut FrameBuffer) -> Result<Option<Frame>, IpcError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = buffer.try_decode()? {
            return Ok(Some(frame));
        }
        buffer.ensure_capacity()?;
        let read = reader.read_buf(buffer.spare()).await?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(IpcError::TruncatedFrame {
                buffered: buffer.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerReply;
    use stagecoach_core::{Ack, WorkerIdentity};
    use std::time::Duration;

    #[test]
    fn test_frame_layout() {
        let token = GenerationToken::generate();
        let frame = encode_frame(b"hello", token).unwrap();

        assert_eq!(frame.len(), 5 + FRAME_OVERHEAD);
        assert_eq!(&frame[..4], &5i32.to_be_bytes());
        assert_eq!(&frame[4..9], b"hello");
        assert_eq!(&frame[9..], &token.to_bytes());
    }

    #[test]
    fn test_termination_frame() {
        let bytes = termination_frame();
        assert_eq!(bytes.len(), FRAME_OVERHEAD);

        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&bytes);
        let frame = buffer.try_decode().unwrap().unwrap();
        assert!(frame.is_termination());
        assert!(frame.token.is_first());
    }

    #[test]
    fn test_empty_payload_with_token_is_not_termination() {
        let token = GenerationToken::generate();
        let bytes = encode_frame(&[], token).unwrap();
        assert_eq!(bytes.len(), FRAME_OVERHEAD);

        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&bytes);
        let frame = buffer.try_decode().unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.token, token);
        assert!(!frame.is_termination());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let token = GenerationToken::generate();
        let bytes = encode_frame(b"partial payload", token).unwrap();

        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&bytes[..2]);
        assert!(buffer.try_decode().unwrap().is_none());
        buffer.extend_from_slice(&bytes[2..bytes.len() - 1]);
        assert!(buffer.try_decode().unwrap().is_none());
        buffer.extend_from_slice(&bytes[bytes.len() - 1..]);

        let frame = buffer.try_decode().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"partial payload");
        assert_eq!(frame.token, token);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&encode_frame(b"one", GenerationToken::first()).unwrap());
        buffer.extend_from_slice(&encode_frame(b"two", GenerationToken::first()).unwrap());

        assert_eq!(&buffer.try_decode().unwrap().unwrap().payload[..], b"one");
        assert_eq!(&buffer.try_decode().unwrap().unwrap().payload[..], b"two");
        assert!(buffer.try_decode().unwrap().is_none());
    }

    #[test]
    fn test_buffer_grows_to_fit_large_payload() {
        let payload = vec![0xabu8; 10_000_000];
        let token = GenerationToken::generate();
        let bytes = encode_frame(&payload, token).unwrap();

        let mut buffer = FrameBuffer::with_capacity(16, DEFAULT_MAX_PAYLOAD_LEN);
        buffer.extend_from_slice(&bytes[..LENGTH_FIELD_LEN]);
        buffer.ensure_capacity().unwrap();
        assert!(buffer.capacity() >= payload.len() + FRAME_OVERHEAD);

        buffer.extend_from_slice(&bytes[LENGTH_FIELD_LEN..]);
        let frame = buffer.try_decode().unwrap().unwrap();
        assert_eq!(frame.payload.len(), payload.len());
        assert_eq!(&frame.payload[..], &payload[..]);
        assert_eq!(frame.token, token);
    }

    #[test]
    fn test_capacity_doubles_when_full() {
        // required size wins over doubling
        let mut buffer = FrameBuffer::with_capacity(8, DEFAULT_MAX_PAYLOAD_LEN);
        buffer.extend_from_slice(&2i32.to_be_bytes());
        buffer.ensure_capacity().unwrap();
        assert!(buffer.capacity() >= 2 + FRAME_OVERHEAD);

        // doubling wins over required size
        let mut buffer = FrameBuffer::with_capacity(64, DEFAULT_MAX_PAYLOAD_LEN);
        buffer.extend_from_slice(&50i32.to_be_bytes());
        buffer.ensure_capacity().unwrap();
        assert!(buffer.capacity() >= 128);
    }

    #[test]
    fn test_absurd_lengths_rejected() {
        let mut buffer = FrameBuffer::new(1024);
        buffer.extend_from_slice(&(-5i32).to_be_bytes());
        assert!(matches!(buffer.try_decode(), Err(IpcError::InvalidFrameLength(-5))));

        let mut buffer = FrameBuffer::new(1024);
        buffer.extend_from_slice(&4096i32.to_be_bytes());
        assert!(matches!(
            buffer.try_decode(),
            Err(IpcError::FrameTooLarge { length: 4096, max: 1024 })
        ));
    }

    #[test]
    fn test_message_round_trip() {
        let ack = Ack::success(WorkerIdentity::first_generation(2), 1, Duration::from_millis(3), None);
        let token = GenerationToken::generate();
        let bytes = encode_message(WorkerReply::Ack { ack: ack.clone() }, token).unwrap();

        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&bytes);
        let frame = buffer.try_decode().unwrap().unwrap();
        assert_eq!(frame.token, token);
        match frame.decode_message::<WorkerReply>().unwrap() {
            WorkerReply::Ack { ack: decoded } => assert_eq!(decoded, ack),
            other => panic!("Expected ack, got {}", other.kind()),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let payload = serde_json::json!({
            "protocol_version": IPC_PROTOCOL_VERSION + 1,
            "timestamp": chrono::Utc::now(),
            "message": {"type": "collect_timeline"},
        });
        let bytes = encode_frame(payload.to_string().as_bytes(), GenerationToken::first()).unwrap();

        let mut buffer = FrameBuffer::default();
        buffer.extend_from_slice(&bytes);
        let frame = buffer.try_decode().unwrap().unwrap();
        let result = frame.decode_message::<crate::protocol::CoordinatorCommand>();
        assert!(matches!(result, Err(IpcError::ProtocolVersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = vec![7u8; 5000];
        let bytes = encode_frame(&payload, GenerationToken::first()).unwrap();

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(&bytes).await.unwrap();
            client.write_all(&termination_frame()).await.unwrap();
        });

        let mut buffer = FrameBuffer::new(DEFAULT_MAX_PAYLOAD_LEN);
        let frame = read_frame(&mut server, &mut buffer).await.unwrap().unwrap();
        assert_eq!(frame.payload.len(), 5000);
        let end = read_frame(&mut server, &mut buffer).await.unwrap().unwrap();
        assert!(end.is_termination());

        writer.await.unwrap();
        assert!(read_frame(&mut server, &mut buffer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        {
            use tokio::io::AsyncWriteExt;
            client.write_all(&10i32.to_be_bytes()).await.unwrap();
            client.write_all(b"abc").await.unwrap();
        }
        drop(client);

        let mut buffer = FrameBuffer::default();
        let result = read_frame(&mut server, &mut buffer).await;
        assert!(matches!(result, Err(IpcError::TruncatedFrame { buffered: 7 })));
    }
}
