//! Worker-side stage loop
//!
//! A worker receives the scenario, configuration and cluster messages,
//! then executes distributed stages on request and answers each one with
//! exactly one ack. Stage errors and panics are caught and reported in the
//! ack; only transport failures end the loop abnormally.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use stagecoach_core::{
    Ack, AuxiliaryData, Cluster, Configuration, GenerationToken, Stage, StageError, StageProgram,
    StageRegistry, Timeline, TimelineEvent, WorkerContext, WorkerIdentity,
};
use stagecoach_ipc::{CoordinatorCommand, WorkerReply, WorkerTransport};

use crate::error::Result;

/// Spawns the process that replaces a restarting worker
#[async_trait]
pub trait WorkerRestarter: Send + Sync {
    /// Start a replacement worker that will rejoin as `identity`
    async fn spawn_replacement(&self, identity: WorkerIdentity) -> Result<()>;
}

/// How the worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The coordinator ended the run
    Terminated,
    /// A replacement process was started with this generation
    Restarting { generation: GenerationToken },
}

/// Worker stage loop over any transport
pub struct WorkerRuntime<T: WorkerTransport> {
    transport: T,
    identity: WorkerIdentity,
    registry: Arc<StageRegistry>,
    restarter: Option<Arc<dyn WorkerRestarter>>,
    program: Option<StageProgram>,
    configuration: Option<Configuration>,
    cluster: Option<Cluster>,
    values: HashMap<String, JsonValue>,
    timeline: Timeline,
}

impl<T: WorkerTransport> WorkerRuntime<T> {
    pub fn new(transport: T, identity: WorkerIdentity, registry: Arc<StageRegistry>) -> Self {
        Self {
            transport,
            identity,
            registry,
            restarter: None,
            program: None,
            configuration: None,
            cluster: None,
            values: HashMap::new(),
            timeline: Timeline::for_worker(identity.index),
        }
    }

    /// Enable process restarts
    pub fn with_restarter(mut self, restarter: Arc<dyn WorkerRestarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    /// Run until the coordinator ends the run or a restart hands over to a new process
    pub async fn run(mut self) -> Result<WorkerExit> {
        info!("{} entering stage loop", self.identity);

        loop {
            let command = match self.transport.receive().await? {
                Some(command) => command,
                None => {
                    info!("{} received termination, leaving stage loop", self.identity);
                    break;
                }
            };
            debug!("{} received {}", self.identity, command.kind());

            match command {
                CoordinatorCommand::Scenario { program } => {
                    debug!("Scenario with {} stages", program.len());
                    self.program = Some(program);
                }
                CoordinatorCommand::Configuration { configuration } => {
                    info!("Running configuration {}", configuration.name);
                    self.configuration = Some(configuration);
                }
                CoordinatorCommand::Cluster { cluster } => {
                    info!("Running in cluster {}", cluster);
                    self.cluster = Some(cluster);
                }
                CoordinatorCommand::CollectTimeline => {
                    let timeline = self.timeline.take();
                    self.transport
                        .send(&WorkerReply::Timeline { timeline }, GenerationToken::first())
                        .await?;
                }
                CoordinatorCommand::RunStage { stage_id, data } => {
                    let (ack, restart_requested) = self.execute_stage(stage_id, data).await;
                    if restart_requested {
                        if let Some(exit) = self.restart(ack.clone()).await? {
                            return Ok(exit);
                        }
                    }
                    self.transport
                        .send(&WorkerReply::Ack { ack }, GenerationToken::first())
                        .await?;
                }
            }
        }

        self.transport.close().await?;
        Ok(WorkerExit::Terminated)
    }

    /// Hand over to a replacement process. Returns `None` when restarts are
    /// unavailable and the plain ack should be sent instead.
    async fn restart(&mut self, ack: Ack) -> Result<Option<WorkerExit>> {
        let restarter = match (&self.restarter, self.transport.supports_restart()) {
            (Some(restarter), true) => restarter.clone(),
            _ => {
                warn!("{} requested a restart, but this worker cannot be restarted", self.identity);
                return Ok(None);
            }
        };

        let generation = GenerationToken::generate();
        info!("{} restarting as generation {}", self.identity, generation);
        self.transport
            .send(&WorkerReply::Ack { ack }, generation)
            .await?;
        self.transport.close().await?;

        restarter
            .spawn_replacement(WorkerIdentity::new(self.identity.index, generation))
            .await?;
        Ok(Some(WorkerExit::Restarting { generation }))
    }

    async fn execute_stage(&mut self, stage_id: usize, data: AuxiliaryData) -> (Ack, bool) {
        let started_at = Utc::now();
        let started = Instant::now();
        let stage_name = self
            .program
            .as_ref()
            .and_then(|program| program.stage(stage_id).ok())
            .map(|descriptor| descriptor.name.clone())
            .unwrap_or_else(|| format!("#{}", stage_id));

        let result = self.invoke_stage(stage_id, data).await;
        let duration = started.elapsed();

        self.timeline.record(TimelineEvent {
            stage_id,
            stage_name: stage_name.clone(),
            started_at,
            duration_ms: duration.as_millis() as u64,
            success: result.is_ok(),
        });

        match result {
            Ok((payload, restart_requested)) => {
                debug!("Stage {} ({}) finished in {:?}", stage_id, stage_name, duration);
                (
                    Ack::success(self.identity, stage_id, duration, payload),
                    restart_requested,
                )
            }
            Err(e) => {
                error!("Stage {} ({}) failed on {}: {}", stage_id, stage_name, self.identity, e);
                (Ack::failure(self.identity, stage_id, e.to_string(), duration), false)
            }
        }
    }

    async fn invoke_stage(
        &mut self,
        stage_id: usize,
        data: AuxiliaryData,
    ) -> std::result::Result<(Option<JsonValue>, bool), StageError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| StageError::failed("no scenario received"))?;
        let descriptor = program.stage(stage_id)?;

        let stage = match self.registry.instantiate(descriptor)? {
            Stage::Distributed(stage) => stage,
            Stage::Local(stage) => {
                return Err(StageError::failed(format!(
                    "stage '{}' runs on the coordinator only",
                    stage.name()
                )));
            }
        };

        let mut ctx = WorkerContext::new(
            self.identity,
            stage_id,
            data,
            self.configuration.as_ref(),
            self.cluster.as_ref(),
            &mut self.values,
        );
        let outcome = AssertUnwindSafe(stage.execute_on_worker(&mut ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => Ok((payload, ctx.restart_requested())),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(StageError::Panicked(panic_message(panic))),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
