//! In-process connection manager
//!
//! Runs a single worker loop on its own task, exchanging commands and
//! replies over single-slot channels.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagecoach_core::{
    Ack, AuxiliaryData, Cluster, Configuration, StageProgram, StageRegistry, Timeline,
    WorkerIdentity,
};
use stagecoach_ipc::{ChannelEndpoint, ChannelTransport, CoordinatorCommand, WorkerReply};

use super::WorkerConnections;
use crate::error::{ExecutionError, Result};
use crate::worker::{WorkerExit, WorkerRuntime};

const LOCAL_WORKER: usize = 0;

/// Connection manager with one worker running inside the coordinator process
pub struct LocalConnections {
    registry: Arc<StageRegistry>,
    endpoint: Option<ChannelEndpoint>,
    worker: Option<JoinHandle<Result<WorkerExit>>>,
}

impl LocalConnections {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            registry,
            endpoint: None,
            worker: None,
        }
    }

    fn endpoint(&mut self) -> Result<&mut ChannelEndpoint> {
        self.endpoint
            .as_mut()
            .ok_or(ExecutionError::NotConnected { worker: LOCAL_WORKER })
    }

    async fn send(&mut self, command: CoordinatorCommand) -> Result<()> {
        self.endpoint()?
            .commands
            .send(command)
            .await
            .map_err(|_| ExecutionError::WorkerDisconnected {
                worker: LOCAL_WORKER,
                reason: "in-process worker stopped".to_string(),
            })
    }

    async fn receive(&mut self) -> Result<WorkerReply> {
        self.endpoint()?
            .replies
            .recv()
            .await
            .ok_or_else(|| ExecutionError::WorkerDisconnected {
                worker: LOCAL_WORKER,
                reason: "in-process worker stopped".to_string(),
            })
    }

    fn check_worker_count(num_workers: usize) -> Result<()> {
        if num_workers > 1 {
            return Err(ExecutionError::InvalidState(format!(
                "local mode runs a single worker, {} requested",
                num_workers
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerConnections for LocalConnections {
    async fn establish(&mut self) -> Result<()> {
        if self.endpoint.is_some() {
            return Ok(());
        }
        let (transport, endpoint) = ChannelTransport::pair();
        let runtime = WorkerRuntime::new(
            transport,
            WorkerIdentity::first_generation(LOCAL_WORKER),
            self.registry.clone(),
        );
        self.worker = Some(tokio::spawn(runtime.run()));
        self.endpoint = Some(endpoint);
        info!("Started in-process worker");
        Ok(())
    }

    fn num_workers(&self) -> usize {
        1
    }

    async fn send_scenario(&mut self, program: &StageProgram) -> Result<()> {
        self.send(CoordinatorCommand::Scenario {
            program: program.clone(),
        })
        .await
    }

    async fn send_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.send(CoordinatorCommand::Configuration {
            configuration: configuration.clone(),
        })
        .await
    }

    async fn send_cluster(&mut self, cluster: &Cluster) -> Result<()> {
        self.send(CoordinatorCommand::Cluster {
            cluster: cluster.clone(),
        })
        .await
    }

    async fn run_stage(
        &mut self,
        stage_id: usize,
        data: AuxiliaryData,
        num_workers: usize,
    ) -> Result<Vec<Ack>> {
        Self::check_worker_count(num_workers)?;
        if num_workers == 0 {
            return Ok(Vec::new());
        }

        self.send(CoordinatorCommand::RunStage { stage_id, data }).await?;
        match self.receive().await? {
            WorkerReply::Ack { ack } => Ok(vec![ack]),
            other => Err(ExecutionError::ProtocolViolation {
                worker: LOCAL_WORKER,
                message: format!("expected an ack, got {}", other.kind()),
            }),
        }
    }

    async fn receive_timelines(&mut self, num_workers: usize) -> Result<Vec<Timeline>> {
        Self::check_worker_count(num_workers)?;
        if num_workers == 0 {
            return Ok(Vec::new());
        }

        self.send(CoordinatorCommand::CollectTimeline).await?;
        match self.receive().await? {
            WorkerReply::Timeline { timeline } => Ok(vec![timeline]),
            other => Err(ExecutionError::ProtocolViolation {
                worker: LOCAL_WORKER,
                message: format!("expected a timeline, got {}", other.kind()),
            }),
        }
    }

    async fn release(&mut self) -> Result<()> {
        // Dropping the command sender ends the worker loop
        self.endpoint = None;
        if let Some(worker) = self.worker.take() {
            match worker.await {
                Ok(Ok(exit)) => debug!("In-process worker exited: {:?}", exit),
                Ok(Err(e)) => warn!("In-process worker failed: {}", e),
                Err(e) => warn!("In-process worker task failed: {}", e),
            }
        }
        Ok(())
    }
}
