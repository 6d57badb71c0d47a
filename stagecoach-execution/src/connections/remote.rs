//! TCP connection manager for remote worker processes
//!
//! Every admitted worker gets a reader task that decodes frames from its
//! socket and forwards them on a single event channel. All bookkeeping
//! (slot records, pending reconnections, partially sent multicasts) is
//! owned by the task driving the scheduler, so none of it needs locking.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::future::join_all;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use stagecoach_core::{
    Ack, AuxiliaryData, Cluster, Configuration, GenerationToken, StageProgram, Timeline,
    WorkerIdentity,
};
use stagecoach_ipc::{
    encode_message, read_frame, termination_frame, CoordinatorCommand, Frame, FrameBuffer,
    HandshakeRequest, HandshakeResponse, IpcError, WorkerReply, DEFAULT_MAX_PAYLOAD_LEN,
};

use super::{sort_acks, sort_timelines, WorkerConnections};
use crate::error::{ExecutionError, Result};

/// Settings for [`RemoteConnections`]
#[derive(Debug, Clone)]
pub struct RemoteConnectionsConfig {
    pub bind_address: String,
    pub port: u16,
    pub expected_workers: usize,
    pub discovery_timeout: Duration,
    pub reconnect_timeout: Duration,
    /// How long a single peer may take to send its handshake request
    pub handshake_timeout: Duration,
    pub max_payload_len: usize,
}

impl Default for RemoteConnectionsConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2103,
            expected_workers: 1,
            discovery_timeout: Duration::from_secs(300),
            reconnect_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Open connection to one worker
struct WorkerLink {
    id: u64,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    /// Bytes of the current multicast not yet written to the socket
    pending_write: Option<Bytes>,
}

impl WorkerLink {
    async fn flush(&mut self) -> std::result::Result<(), IpcError> {
        while let Some(buf) = self.pending_write.as_mut() {
            if buf.is_empty() {
                self.pending_write = None;
                break;
            }
            let written = self.writer.write(buf).await?;
            if written == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            buf.advance(written);
        }
        self.writer.flush().await?;
        Ok(())
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Per-slot bookkeeping
struct WorkerRecord {
    identity: WorkerIdentity,
    link: Option<WorkerLink>,
    pending_reconnection: bool,
}

enum LinkEventKind {
    Frame(Frame),
    Closed,
    Failed(IpcError),
}

/// Something a reader task observed on its socket
struct LinkEvent {
    worker: usize,
    link_id: u64,
    kind: LinkEventKind,
}

enum Accepted {
    Admitted(usize),
    /// The peer went away before completing the handshake
    Dropped,
    TimedOut,
}

/// State frames re-sent to workers that rejoin after a restart
#[derive(Default)]
struct ReplayFrames {
    scenario: Option<Bytes>,
    configuration: Option<Bytes>,
    cluster: Option<Bytes>,
}

impl ReplayFrames {
    fn frames(&self) -> Vec<Bytes> {
        [&self.scenario, &self.configuration, &self.cluster]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Connection manager for workers running as separate processes
pub struct RemoteConnections {
    config: RemoteConnectionsConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    records: Vec<Option<WorkerRecord>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    pending_reconnections: usize,
    next_link_id: u64,
    replay: ReplayFrames,
}

impl RemoteConnections {
    /// Bind the coordinator socket. Workers are admitted by [`WorkerConnections::establish`].
    pub async fn bind(config: RemoteConnectionsConfig) -> Result<Self> {
        if config.expected_workers == 0 {
            return Err(ExecutionError::ConfigurationError(
                "at least one worker is required".to_string(),
            ));
        }

        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))
            .await
            .map_err(|e| ExecutionError::Bind {
                address: format!("{}:{}", config.bind_address, config.port),
                message: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(IpcError::from)?;
        info!("Coordinator listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let records = (0..config.expected_workers).map(|_| None).collect();

        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            records,
            events_tx,
            events_rx,
            pending_reconnections: 0,
            next_link_id: 0,
            replay: ReplayFrames::default(),
        })
    }

    /// Address the coordinator socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of workers that announced a restart and have not rejoined yet
    pub fn pending_reconnections(&self) -> usize {
        self.pending_reconnections
    }

    /// Current identity of the worker in `slot`
    pub fn identity(&self, slot: usize) -> Option<WorkerIdentity> {
        self.records.get(slot)?.as_ref().map(|record| record.identity)
    }

    fn connected_count(&self) -> usize {
        self.records
            .iter()
            .flatten()
            .filter(|record| record.link.is_some())
            .count()
    }

    /// Decide which slot a handshake request gets, or why it is refused
    fn admit(&self, request: &HandshakeRequest) -> std::result::Result<usize, String> {
        let expected = self.records.len();
        match request.requested_index {
            Some(index) if index >= expected => Err(format!(
                "requested slot {} but only {} workers are expected",
                index, expected
            )),
            Some(index) => match &self.records[index] {
                None if request.generation.is_first() => Ok(index),
                None => Err(format!(
                    "slot {} was never occupied, generation {} cannot rejoin it",
                    index, request.generation
                )),
                Some(record) if !record.pending_reconnection => {
                    Err(format!("slot {} is already held by {}", index, record.identity))
                }
                Some(record) if record.identity.generation != request.generation => Err(format!(
                    "slot {} awaits generation {}, got {}",
                    index, record.identity.generation, request.generation
                )),
                Some(_) => Ok(index),
            },
            None if request.generation.is_first() => self
                .records
                .iter()
                .position(Option::is_none)
                .ok_or_else(|| "no free worker slots".to_string()),
            None => self
                .records
                .iter()
                .position(|record| {
                    record.as_ref().is_some_and(|record| {
                        record.pending_reconnection && record.identity.generation == request.generation
                    })
                })
                .ok_or_else(|| format!("no slot awaits generation {}", request.generation)),
        }
    }

    async fn accept_worker(&mut self, deadline: Instant) -> Result<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ExecutionError::InvalidState("coordinator socket is closed".to_string()))?;

        let (mut socket, peer) = match tokio::time::timeout_at(deadline, listener.accept()).await {
            Err(_) => return Ok(Accepted::TimedOut),
            Ok(accepted) => accepted.map_err(IpcError::from)?,
        };
        socket.set_nodelay(true).map_err(IpcError::from)?;

        // A silent peer must not hold up the workers queued behind it
        let handshake_deadline = deadline.min(Instant::now() + self.config.handshake_timeout);
        let request = match tokio::time::timeout_at(handshake_deadline, HandshakeRequest::read_from(&mut socket))
            .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!("Dropping connection from {} during handshake: {}", peer, e);
                return Ok(Accepted::Dropped);
            }
            Err(_) => {
                let e = IpcError::Timeout(format!("no handshake request from {}", peer));
                warn!("Dropping connection: {}", e);
                return Ok(Accepted::Dropped);
            }
        };
        debug!(
            "Handshake from {}: requested slot {:?}, generation {}",
            peer, request.requested_index, request.generation
        );

        let slot = match self.admit(&request) {
            Ok(slot) => slot,
            Err(reason) => {
                error!("Rejecting worker at {}: {}", peer, reason);
                return Err(ExecutionError::HandshakeRejected {
                    peer: peer.to_string(),
                    reason,
                });
            }
        };

        HandshakeResponse::new(slot, self.records.len())
            .write_to(&mut socket)
            .await?;
        self.install_link(slot, request.generation, socket, peer);
        Ok(Accepted::Admitted(slot))
    }

    fn install_link(&mut self, slot: usize, generation: GenerationToken, socket: TcpStream, peer: SocketAddr) {
        let link_id = self.next_link_id;
        self.next_link_id += 1;

        let (reader, writer) = socket.into_split();
        let reader = spawn_reader(
            slot,
            link_id,
            reader,
            self.config.max_payload_len,
            self.events_tx.clone(),
        );
        let link = WorkerLink {
            id: link_id,
            peer,
            writer,
            reader,
            pending_write: None,
        };

        match &mut self.records[slot] {
            Some(record) => {
                record.link = Some(link);
                if record.pending_reconnection {
                    record.pending_reconnection = false;
                    self.pending_reconnections -= 1;
                }
                info!("{} rejoined from {}", record.identity, peer);
            }
            empty => {
                let identity = WorkerIdentity::new(slot, generation);
                info!("{} connected from {}", identity, peer);
                *empty = Some(WorkerRecord {
                    identity,
                    link: Some(link),
                    pending_reconnection: false,
                });
            }
        }
    }

    fn link_mut(&mut self, worker: usize) -> Result<&mut WorkerLink> {
        self.records
            .get_mut(worker)
            .and_then(Option::as_mut)
            .and_then(|record| record.link.as_mut())
            .ok_or(ExecutionError::NotConnected { worker })
    }

    fn is_current_link(&self, worker: usize, link_id: u64) -> bool {
        self.records
            .get(worker)
            .and_then(Option::as_ref)
            .and_then(|record| record.link.as_ref())
            .is_some_and(|link| link.id == link_id)
    }

    fn check_worker_count(&self, count: usize) -> Result<()> {
        if count > self.records.len() {
            return Err(ExecutionError::InvalidState(format!(
                "cannot address {} workers, only {} are connected",
                count,
                self.records.len()
            )));
        }
        Ok(())
    }

    /// Send the same frame to the first `count` workers, writing to all of
    /// them concurrently.
    async fn multicast(&mut self, frame: Bytes, count: usize) -> Result<()> {
        self.check_worker_count(count)?;
        for worker in 0..count {
            if self.link_mut(worker)?.pending_write.is_some() {
                return Err(ExecutionError::MulticastInProgress { worker });
            }
        }

        let mut links = Vec::with_capacity(count);
        for (worker, record) in self.records[..count].iter_mut().enumerate() {
            let link = record
                .as_mut()
                .and_then(|record| record.link.as_mut())
                .ok_or(ExecutionError::NotConnected { worker })?;
            link.pending_write = Some(frame.clone());
            links.push((worker, link));
        }

        let results = join_all(
            links
                .into_iter()
                .map(|(worker, link)| async move { (worker, link.flush().await) }),
        )
        .await;
        for (worker, result) in results {
            if let Err(e) = result {
                return Err(ExecutionError::WorkerDisconnected {
                    worker,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn send_to(&mut self, worker: usize, frame: Bytes) -> Result<()> {
        let link = self.link_mut(worker)?;
        if link.pending_write.is_some() {
            return Err(ExecutionError::MulticastInProgress { worker });
        }
        link.pending_write = Some(frame);
        link.flush().await.map_err(|e| ExecutionError::WorkerDisconnected {
            worker,
            reason: e.to_string(),
        })
    }

    /// Wait for exactly one reply from each of the first `count` workers
    async fn gather(&mut self, count: usize) -> Result<Vec<(usize, WorkerReply)>> {
        let mut responded = vec![false; count];
        let mut replies = Vec::with_capacity(count);

        while replies.len() < count {
            // The sender half lives in `self`, so the channel never closes here
            let event = self.events_rx.recv().await.ok_or_else(|| {
                ExecutionError::InvalidState("worker event channel closed".to_string())
            })?;
            if !self.is_current_link(event.worker, event.link_id) {
                debug!("Ignoring event from a replaced link of worker {}", event.worker);
                continue;
            }

            let worker = event.worker;
            match event.kind {
                LinkEventKind::Frame(frame) => {
                    if worker >= count || responded[worker] {
                        return Err(ExecutionError::ProtocolViolation {
                            worker,
                            message: "unsolicited reply".to_string(),
                        });
                    }
                    let reply: WorkerReply = frame.decode_message()?;
                    responded[worker] = true;
                    if !frame.token.is_first() {
                        self.begin_restart(worker, frame.token);
                    }
                    replies.push((worker, reply));
                }
                LinkEventKind::Closed => {
                    self.drop_link(worker);
                    return Err(ExecutionError::WorkerDisconnected {
                        worker,
                        reason: "connection closed".to_string(),
                    });
                }
                LinkEventKind::Failed(e) => {
                    self.drop_link(worker);
                    return Err(ExecutionError::WorkerDisconnected {
                        worker,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(replies)
    }

    /// Forget a dead connection so later sends fail fast instead of waiting on it
    fn drop_link(&mut self, worker: usize) {
        if let Some(record) = self.records[worker].as_mut() {
            warn!("Lost connection to {}", record.identity);
            record.link = None;
        }
    }

    fn begin_restart(&mut self, worker: usize, generation: GenerationToken) {
        if let Some(record) = self.records[worker].as_mut() {
            info!(
                "{} is restarting, expecting generation {} to rejoin",
                record.identity, generation
            );
            record.link = None;
            record.identity.generation = generation;
            if !record.pending_reconnection {
                record.pending_reconnection = true;
                self.pending_reconnections += 1;
            }
        }
    }

    /// Block until every restarting worker has rejoined and caught up
    async fn await_reconnections(&mut self) -> Result<()> {
        if self.pending_reconnections == 0 {
            return Ok(());
        }
        info!("Waiting for {} restarting workers to rejoin", self.pending_reconnections);
        let deadline = Instant::now() + self.config.reconnect_timeout;

        while self.pending_reconnections > 0 {
            match self.accept_worker(deadline).await? {
                Accepted::Admitted(slot) => {
                    for frame in self.replay.frames() {
                        self.send_to(slot, frame).await?;
                    }
                }
                Accepted::Dropped => continue,
                Accepted::TimedOut => {
                    return Err(ExecutionError::ReconnectTimeout {
                        pending: self.pending_reconnections,
                    });
                }
            }
        }
        Ok(())
    }
}

fn spawn_reader(
    worker: usize,
    link_id: u64,
    mut reader: OwnedReadHalf,
    max_payload_len: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = FrameBuffer::new(max_payload_len);
        loop {
            let (kind, done) = match read_frame(&mut reader, &mut buffer).await {
                // A restart announcement is the last frame this connection carries
                Ok(Some(frame)) => {
                    let done = !frame.token.is_first();
                    (LinkEventKind::Frame(frame), done)
                }
                Ok(None) => (LinkEventKind::Closed, true),
                Err(e) => (LinkEventKind::Failed(e), true),
            };
            let event = LinkEvent {
                worker,
                link_id,
                kind,
            };
            if events.send(event).is_err() || done {
                break;
            }
        }
    })
}

#[async_trait]
impl WorkerConnections for RemoteConnections {
    async fn establish(&mut self) -> Result<()> {
        let expected = self.records.len();
        info!("Waiting for {} workers to connect on {}", expected, self.local_addr);
        let deadline = Instant::now() + self.config.discovery_timeout;

        while self.connected_count() < expected {
            match self.accept_worker(deadline).await? {
                Accepted::Admitted(_) | Accepted::Dropped => {}
                Accepted::TimedOut => {
                    return Err(ExecutionError::DiscoveryTimeout {
                        connected: self.connected_count(),
                        expected,
                    });
                }
            }
        }
        info!("All {} workers connected", expected);
        Ok(())
    }

    fn num_workers(&self) -> usize {
        self.records.len()
    }

    async fn send_scenario(&mut self, program: &StageProgram) -> Result<()> {
        let frame = encode_message(
            CoordinatorCommand::Scenario {
                program: program.clone(),
            },
            GenerationToken::first(),
        )?;
        self.replay.scenario = Some(frame.clone());
        self.multicast(frame, self.records.len()).await
    }

    async fn send_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        let frame = encode_message(
            CoordinatorCommand::Configuration {
                configuration: configuration.clone(),
            },
            GenerationToken::first(),
        )?;
        self.replay.configuration = Some(frame.clone());
        self.multicast(frame, self.records.len()).await
    }

    async fn send_cluster(&mut self, cluster: &Cluster) -> Result<()> {
        let frame = encode_message(
            CoordinatorCommand::Cluster {
                cluster: cluster.clone(),
            },
            GenerationToken::first(),
        )?;
        self.replay.cluster = Some(frame.clone());
        self.multicast(frame, self.records.len()).await
    }

    async fn run_stage(
        &mut self,
        stage_id: usize,
        data: AuxiliaryData,
        num_workers: usize,
    ) -> Result<Vec<Ack>> {
        let frame = encode_message(
            CoordinatorCommand::RunStage { stage_id, data },
            GenerationToken::first(),
        )?;
        self.multicast(frame, num_workers).await?;

        let mut acks = Vec::with_capacity(num_workers);
        for (worker, reply) in self.gather(num_workers).await? {
            match reply {
                WorkerReply::Ack { ack } if ack.worker.index == worker => acks.push(ack),
                WorkerReply::Ack { ack } => {
                    return Err(ExecutionError::ProtocolViolation {
                        worker,
                        message: format!("ack claims worker index {}", ack.worker.index),
                    });
                }
                other => {
                    return Err(ExecutionError::ProtocolViolation {
                        worker,
                        message: format!("expected an ack, got {}", other.kind()),
                    });
                }
            }
        }
        sort_acks(&mut acks);

        self.await_reconnections().await?;
        Ok(acks)
    }

    async fn receive_timelines(&mut self, num_workers: usize) -> Result<Vec<Timeline>> {
        let frame = encode_message(CoordinatorCommand::CollectTimeline, GenerationToken::first())?;
        self.multicast(frame, num_workers).await?;

        let mut timelines = Vec::with_capacity(num_workers);
        for (worker, reply) in self.gather(num_workers).await? {
            match reply {
                WorkerReply::Timeline { timeline } => timelines.push(timeline),
                other => {
                    return Err(ExecutionError::ProtocolViolation {
                        worker,
                        message: format!("expected a timeline, got {}", other.kind()),
                    });
                }
            }
        }
        sort_timelines(&mut timelines);

        self.await_reconnections().await?;
        Ok(timelines)
    }

    async fn release(&mut self) -> Result<()> {
        let termination = termination_frame();
        for worker in 0..self.records.len() {
            let Some(link) = self.records[worker].as_mut().and_then(|r| r.link.as_mut()) else {
                continue;
            };
            link.pending_write = Some(termination.clone());
            if let Err(e) = link.flush().await {
                warn!("Failed to send termination to worker {} at {}: {}", worker, link.peer, e);
            }
            if let Err(e) = link.writer.shutdown().await {
                debug!("Failed to shut down connection to worker {}: {}", worker, e);
            }
        }
        for record in self.records.iter_mut().flatten() {
            record.link = None;
        }
        self.listener = None;
        info!("Released all worker connections");
        Ok(())
    }
}
