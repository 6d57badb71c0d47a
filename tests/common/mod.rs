//! Shared fixtures: test stages and in-process TCP workers

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use stagecoach_core::{
    CoordinatorState, DistributedStage, GenerationToken, LocalStage, Stage, StageError, StageOutcome,
    StageRegistry, WorkerContext, WorkerIdentity,
};
use stagecoach_execution::{
    builtin_registry, ExecutionError, RemoteConnectionsConfig, WorkerExit, WorkerRestarter, WorkerRuntime,
};
use stagecoach_ipc::{HandshakeRequest, IpcError, TcpWorkerTransport};

/// Distributed stage counting its executions per worker
pub const RECORD_STAGE: &str = "record";
/// Distributed stage failing on the worker named by `fail_on`, or everywhere
/// when the configuration sets `fail = true`
pub const FLAKY_STAGE: &str = "flaky";
/// Local stage counting its executions on the coordinator
pub const MARK_STAGE: &str = "mark";
/// Distributed stage that takes `delay_ms` on the worker named by `slow_worker`
pub const LAG_STAGE: &str = "lag";

pub const MAX_PAYLOAD: usize = 1024 * 1024;

struct Record;

#[async_trait]
impl DistributedStage for Record {
    fn name(&self) -> &str {
        RECORD_STAGE
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<Value>, StageError> {
        let worker = ctx.worker_index();
        let count = ctx
            .values()
            .entry("record.count".to_string())
            .or_insert(json!(0));
        let next = count.as_u64().unwrap_or(0) + 1;
        *count = json!(next);
        Ok(Some(json!({ "worker": worker, "count": next })))
    }
}

struct Flaky {
    fail_on: Option<u64>,
    exit_on_failure: bool,
}

#[async_trait]
impl DistributedStage for Flaky {
    fn name(&self) -> &str {
        FLAKY_STAGE
    }

    fn exit_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<Value>, StageError> {
        let configured = ctx
            .configuration()
            .and_then(|c| c.properties.get("fail"))
            .is_some_and(|v| v == "true");
        if configured || self.fail_on == Some(ctx.worker_index() as u64) {
            return Err(StageError::failed(format!("worker {} gave up", ctx.worker_index())));
        }
        Ok(None)
    }
}

struct Mark;

#[async_trait]
impl LocalStage for Mark {
    fn name(&self) -> &str {
        MARK_STAGE
    }

    async fn execute(&self, state: &mut CoordinatorState) -> Result<StageOutcome, StageError> {
        let marks = state.get("marks").and_then(Value::as_u64).unwrap_or(0);
        state.put("marks", json!(marks + 1));
        Ok(StageOutcome::Success)
    }
}

/// When a worker started or finished a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagEvent {
    Started { worker: usize, stage_id: usize },
    Finished { worker: usize, stage_id: usize },
}

/// Worker-side lag events in the order they happened, across all workers
pub type LagLog = Arc<Mutex<Vec<LagEvent>>>;

struct Lag {
    slow_worker: Option<u64>,
    delay: Duration,
    log: LagLog,
}

#[async_trait]
impl DistributedStage for Lag {
    fn name(&self) -> &str {
        LAG_STAGE
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<Value>, StageError> {
        let worker = ctx.worker_index();
        let stage_id = ctx.stage_id();
        self.log.lock().unwrap().push(LagEvent::Started { worker, stage_id });
        if self.slow_worker == Some(worker as u64) {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().unwrap().push(LagEvent::Finished { worker, stage_id });
        Ok(None)
    }
}

/// Built-in stages plus a lag stage writing to `log`
pub fn lagging_registry(log: LagLog) -> Arc<StageRegistry> {
    let mut registry = builtin_registry();
    registry.register(LAG_STAGE, move |descriptor| {
        Ok(Stage::Distributed(Box::new(Lag {
            slow_worker: descriptor.u64_property("slow_worker")?,
            delay: Duration::from_millis(descriptor.u64_property("delay_ms")?.unwrap_or(0)),
            log: log.clone(),
        })))
    });
    Arc::new(registry)
}

/// Built-in stages plus the test stages
pub fn registry() -> Arc<StageRegistry> {
    let mut registry = builtin_registry();
    registry
        .register(RECORD_STAGE, |_| Ok(Stage::Distributed(Box::new(Record))))
        .register(FLAKY_STAGE, |descriptor| {
            Ok(Stage::Distributed(Box::new(Flaky {
                fail_on: descriptor.u64_property("fail_on")?,
                exit_on_failure: descriptor.bool_property("exit_on_failure")?.unwrap_or(false),
            })))
        })
        .register(MARK_STAGE, |_| Ok(Stage::Local(Box::new(Mark))));
    Arc::new(registry)
}

pub fn remote_config(expected_workers: usize) -> RemoteConnectionsConfig {
    RemoteConnectionsConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        expected_workers,
        discovery_timeout: Duration::from_secs(10),
        reconnect_timeout: Duration::from_secs(10),
        handshake_timeout: Duration::from_secs(5),
        max_payload_len: MAX_PAYLOAD,
    }
}

pub async fn connect(
    addr: SocketAddr,
    index: Option<usize>,
    generation: GenerationToken,
) -> Result<(TcpWorkerTransport, WorkerIdentity), IpcError> {
    let (transport, response) = TcpWorkerTransport::connect(
        addr,
        HandshakeRequest::new(index, generation),
        100,
        Duration::from_millis(20),
        MAX_PAYLOAD,
    )
    .await?;
    Ok((transport, WorkerIdentity::new(response.assigned_index, generation)))
}

/// Run a worker loop on its own task, as a worker process would
pub fn spawn_worker(
    addr: SocketAddr,
    registry: Arc<StageRegistry>,
    index: Option<usize>,
    generation: GenerationToken,
    restarter: Option<Arc<dyn WorkerRestarter>>,
) -> JoinHandle<Result<WorkerExit, ExecutionError>> {
    tokio::spawn(async move {
        let (transport, identity) = connect(addr, index, generation).await?;
        let mut runtime = WorkerRuntime::new(transport, identity, registry);
        if let Some(restarter) = restarter {
            runtime = runtime.with_restarter(restarter);
        }
        runtime.run().await
    })
}

pub fn spawn_workers(addr: SocketAddr, registry: &Arc<StageRegistry>, count: usize) -> Vec<JoinHandle<Result<WorkerExit, ExecutionError>>> {
    (0..count)
        .map(|_| spawn_worker(addr, registry.clone(), None, GenerationToken::first(), None))
        .collect()
}

/// How replacement workers announce themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejoin {
    /// Request the previous index with the announced token
    SameIndex,
    /// Request any slot with the announced token
    AnySlot,
    /// Let an impostor with a different token try the slot first
    Impostor,
}

/// Restarts workers as new tasks in this process
pub struct TaskRestarter {
    addr: SocketAddr,
    registry: Arc<StageRegistry>,
    rejoin: Rejoin,
    pub replacements: Mutex<Vec<JoinHandle<Result<WorkerExit, ExecutionError>>>>,
    pub rejected_impostors: AtomicUsize,
}

impl TaskRestarter {
    pub fn new(addr: SocketAddr, registry: Arc<StageRegistry>, rejoin: Rejoin) -> Arc<Self> {
        Arc::new(Self {
            addr,
            registry,
            rejoin,
            replacements: Mutex::new(Vec::new()),
            rejected_impostors: AtomicUsize::new(0),
        })
    }

    pub fn take_replacements(&self) -> Vec<JoinHandle<Result<WorkerExit, ExecutionError>>> {
        std::mem::take(&mut *self.replacements.lock().unwrap())
    }
}

#[async_trait]
impl WorkerRestarter for TaskRestarter {
    async fn spawn_replacement(&self, identity: WorkerIdentity) -> Result<(), ExecutionError> {
        if self.rejoin == Rejoin::Impostor {
            let forged = GenerationToken::generate();
            // The coordinator closes the socket instead of answering
            if connect(self.addr, Some(identity.index), forged).await.is_err() {
                self.rejected_impostors.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(());
        }

        let index = match self.rejoin {
            Rejoin::AnySlot => None,
            _ => Some(identity.index),
        };
        let handle = spawn_worker(self.addr, self.registry.clone(), index, identity.generation, None);
        self.replacements.lock().unwrap().push(handle);
        Ok(())
    }
}
