//! Coordinator-side connection management
//!
//! [`WorkerConnections`] is the contract the scheduler drives. The remote
//! implementation talks to worker processes over TCP; the local one runs a
//! single worker loop in-process.

mod local;
mod remote;

pub use local::LocalConnections;
pub use remote::{RemoteConnections, RemoteConnectionsConfig};

use async_trait::async_trait;

use stagecoach_core::{Ack, AuxiliaryData, Cluster, Configuration, StageProgram, Timeline};

use crate::error::Result;

/// Operations the coordinator performs against its workers
#[async_trait]
pub trait WorkerConnections: Send {
    /// Wait until every expected worker is connected
    async fn establish(&mut self) -> Result<()>;

    /// Number of worker slots
    fn num_workers(&self) -> usize;

    /// Broadcast the stage program to all workers
    async fn send_scenario(&mut self, program: &StageProgram) -> Result<()>;

    /// Broadcast the configuration about to run
    async fn send_configuration(&mut self, configuration: &Configuration) -> Result<()>;

    /// Broadcast the cluster about to run
    async fn send_cluster(&mut self, cluster: &Cluster) -> Result<()>;

    /// Run a stage on the first `num_workers` workers and collect their acks,
    /// sorted by worker index
    async fn run_stage(
        &mut self,
        stage_id: usize,
        data: AuxiliaryData,
        num_workers: usize,
    ) -> Result<Vec<Ack>>;

    /// Collect the timelines of the first `num_workers` workers, sorted by worker index
    async fn receive_timelines(&mut self, num_workers: usize) -> Result<Vec<Timeline>>;

    /// Tell the workers to shut down and release all resources
    async fn release(&mut self) -> Result<()>;
}

/// Order acks by logical worker index
pub fn sort_acks(acks: &mut [Ack]) {
    acks.sort_by_key(|ack| ack.worker.index);
}

/// Order timelines by logical worker index
pub fn sort_timelines(timelines: &mut [Timeline]) {
    timelines.sort_by_key(|timeline| timeline.worker_index);
}
