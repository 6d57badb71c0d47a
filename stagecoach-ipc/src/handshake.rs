//! Discovery handshake
//!
//! The handshake uses raw big-endian integers without the frame wrapper:
//! the worker sends `[requested index: i32][generation token: 16 bytes]`,
//! the coordinator answers `[assigned index: i32][total workers: i32]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use stagecoach_core::GenerationToken;

use crate::error::IpcError;

/// Requested index meaning "assign me any free slot"
pub const ANY_SLOT: i32 = -1;

/// Worker to coordinator handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// `None` asks for any free slot
    pub requested_index: Option<usize>,
    pub generation: GenerationToken,
}

impl HandshakeRequest {
    pub const WIRE_LEN: usize = 4 + GenerationToken::LEN;

    pub fn new(requested_index: Option<usize>, generation: GenerationToken) -> Self {
        Self {
            requested_index,
            generation,
        }
    }

    pub fn encode(&self) -> Result<[u8; Self::WIRE_LEN], IpcError> {
        let index = match self.requested_index {
            None => ANY_SLOT,
            Some(index) => i32::try_from(index)
                .map_err(|_| IpcError::InvalidMessage(format!("worker index {} out of range", index)))?,
        };
        let mut bytes = [0u8; Self::WIRE_LEN];
        bytes[..4].copy_from_slice(&index.to_be_bytes());
        bytes[4..].copy_from_slice(&self.generation.to_bytes());
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8; Self::WIRE_LEN]) -> Result<Self, IpcError> {
        let index = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let requested_index = match index {
            ANY_SLOT => None,
            i if i < 0 => {
                return Err(IpcError::InvalidMessage(format!("invalid requested index {}", i)));
            }
            i => Some(i as usize),
        };
        let mut token = [0u8; GenerationToken::LEN];
        token.copy_from_slice(&bytes[4..]);
        Ok(Self {
            requested_index,
            generation: GenerationToken::from_bytes(token),
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, IpcError> {
        let mut bytes = [0u8; Self::WIRE_LEN];
        reader.read_exact(&mut bytes).await?;
        Self::decode(&bytes)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), IpcError> {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Coordinator to worker handshake answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub assigned_index: usize,
    pub total_workers: usize,
}

impl HandshakeResponse {
    pub const WIRE_LEN: usize = 8;

    pub fn new(assigned_index: usize, total_workers: usize) -> Self {
        Self {
            assigned_index,
            total_workers,
        }
    }

    pub fn encode(&self) -> Result<[u8; Self::WIRE_LEN], IpcError> {
        let index = i32::try_from(self.assigned_index)
            .map_err(|_| IpcError::InvalidMessage(format!("worker index {} out of range", self.assigned_index)))?;
        let total = i32::try_from(self.total_workers)
            .map_err(|_| IpcError::InvalidMessage(format!("worker count {} out of range", self.total_workers)))?;
        let mut bytes = [0u8; Self::WIRE_LEN];
        bytes[..4].copy_from_slice(&index.to_be_bytes());
        bytes[4..].copy_from_slice(&total.to_be_bytes());
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8; Self::WIRE_LEN]) -> Result<Self, IpcError> {
        let index = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let total = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if index < 0 || total <= 0 || index >= total {
            return Err(IpcError::InvalidMessage(format!(
                "invalid handshake response: index {} of {} workers",
                index, total
            )));
        }
        Ok(Self::new(index as usize, total as usize))
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, IpcError> {
        let mut bytes = [0u8; Self::WIRE_LEN];
        reader.read_exact(&mut bytes).await?;
        Self::decode(&bytes)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), IpcError> {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }
}
