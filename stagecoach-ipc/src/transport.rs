//! Worker-side transport implementations

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use stagecoach_core::GenerationToken;

use crate::codec::{encode_message, read_frame, FrameBuffer};
use crate::error::IpcError;
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::protocol::{CoordinatorCommand, WorkerReply};

/// Transport a worker uses to talk to its coordinator
#[async_trait]
pub trait WorkerTransport: Send {
    /// Receive the next command; `None` means the coordinator ended the run
    async fn receive(&mut self) -> Result<Option<CoordinatorCommand>, IpcError>;

    /// Send a reply, framed with `token` (non-zero announces a restart)
    async fn send(&mut self, reply: &WorkerReply, token: GenerationToken) -> Result<(), IpcError>;

    /// Whether the worker behind this transport can be replaced by a new process
    fn supports_restart(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// TCP transport to a remote coordinator
pub struct TcpWorkerTransport {
    stream: Option<TcpStream>,
    buffer: FrameBuffer,
}

impl TcpWorkerTransport {
    /// Connect to the coordinator and perform the discovery handshake.
    ///
    /// Connection attempts are retried while the coordinator is not yet
    /// listening.
    pub async fn connect<A>(
        addr: A,
        request: HandshakeRequest,
        attempts: u32,
        retry_interval: Duration,
        max_payload_len: usize,
    ) -> Result<(Self, HandshakeResponse), IpcError>
    where
        A: ToSocketAddrs + Clone + Send + Sync,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        let mut stream = loop {
            attempt += 1;
            match TcpStream::connect(addr.clone()).await.map_err(IpcError::from) {
                Ok(stream) => break stream,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        "Connection attempt {}/{} to coordinator failed: {}",
                        attempt, attempts, e
                    );
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => {
                    return Err(IpcError::IoError(format!(
                        "failed to connect to coordinator after {} attempts: {}",
                        attempts, e
                    )));
                }
            }
        };
        stream.set_nodelay(true)?;

        request.write_to(&mut stream).await?;
        let response = match HandshakeResponse::read_from(&mut stream).await {
            Ok(response) => response,
            Err(IpcError::ConnectionClosed) => {
                return Err(IpcError::HandshakeRejected(
                    "coordinator closed the connection during the handshake".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        if let Some(requested) = request.requested_index {
            if requested != response.assigned_index {
                return Err(IpcError::HandshakeRejected(format!(
                    "requested slot {} but was assigned {}",
                    requested, response.assigned_index
                )));
            }
        }

        Ok((
            Self {
                stream: Some(stream),
                buffer: FrameBuffer::new(max_payload_len),
            },
            response,
        ))
    }

    fn stream(&mut self) -> Result<&mut TcpStream, IpcError> {
        self.stream.as_mut().ok_or(IpcError::NotConnected)
    }
}

#[async_trait]
impl WorkerTransport for TcpWorkerTransport {
    async fn receive(&mut self) -> Result<Option<CoordinatorCommand>, IpcError> {
        let stream = self.stream.as_mut().ok_or(IpcError::NotConnected)?;
        match read_frame(stream, &mut self.buffer).await? {
            None => Err(IpcError::ConnectionClosed),
            Some(frame) if frame.is_termination() => Ok(None),
            Some(frame) => frame.decode_message().map(Some),
        }
    }

    async fn send(&mut self, reply: &WorkerReply, token: GenerationToken) -> Result<(), IpcError> {
        let bytes = encode_message(reply, token)?;
        let stream = self.stream()?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    fn supports_restart(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Failed to shut down coordinator connection: {}", e);
            }
        }
        Ok(())
    }
}

/// In-process transport backed by single-slot hand-off channels
pub struct ChannelTransport {
    commands: mpsc::Receiver<CoordinatorCommand>,
    replies: mpsc::Sender<WorkerReply>,
}

/// Coordinator side of a [`ChannelTransport`]
pub struct ChannelEndpoint {
    pub commands: mpsc::Sender<CoordinatorCommand>,
    pub replies: mpsc::Receiver<WorkerReply>,
}

impl ChannelTransport {
    /// Create a connected transport/endpoint pair
    pub fn pair() -> (ChannelTransport, ChannelEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        (
            ChannelTransport {
                commands: command_rx,
                replies: reply_tx,
            },
            ChannelEndpoint {
                commands: command_tx,
                replies: reply_rx,
            },
        )
    }
}

#[async_trait]
impl WorkerTransport for ChannelTransport {
    async fn receive(&mut self) -> Result<Option<CoordinatorCommand>, IpcError> {
        // A dropped sender is the in-process shutdown signal
        Ok(self.commands.recv().await)
    }

    async fn send(&mut self, reply: &WorkerReply, token: GenerationToken) -> Result<(), IpcError> {
        if !token.is_first() {
            return Err(IpcError::InvalidMessage(
                "in-process workers cannot announce a restart".to_string(),
            ));
        }
        self.replies
            .send(reply.clone())
            .await
            .map_err(|_| IpcError::ConnectionClosed)
    }

    fn supports_restart(&self) -> bool {
        false
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.commands.close();
        Ok(())
    }
}
