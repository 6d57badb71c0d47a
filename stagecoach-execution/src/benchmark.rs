//! Benchmark outer loop
//!
//! Runs the stage program for every configuration and every cluster,
//! collecting worker timelines after each run and folding the results
//! into a process exit code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use stagecoach_core::{Cluster, Configuration, CoordinatorState, StageProgram, StageRegistry, Timeline};

use crate::connections::WorkerConnections;
use crate::error::{ExecutionError, Result};
use crate::scheduler::StageScheduler;

/// Exit code for failures outside any stage: setup, protocol and lost workers
pub const GENERIC_ERROR_EXIT_CODE: i32 = 127;

/// Outcome of one (configuration, cluster) run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRunReport {
    pub configuration: String,
    pub configuration_index: usize,
    pub cluster: Cluster,
    pub failed: bool,
    pub exit_requested: bool,
    pub error: Option<String>,
    pub coordinator_timeline: Timeline,
    pub worker_timelines: Vec<Timeline>,
}

/// Outcome of a whole benchmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub error: Option<String>,
    /// Class of the error that aborted the benchmark
    #[serde(default)]
    pub failure_kind: Option<String>,
    pub runs: Vec<ClusterRunReport>,
}

impl BenchmarkReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            exit_code: 0,
            error: None,
            failure_kind: None,
            runs: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Record a failed run; the first failing configuration decides the exit code
    fn record_failure(&mut self, configuration: &Configuration) {
        if self.exit_code == 0 {
            self.exit_code = i32::try_from(configuration.index).unwrap_or(i32::MAX);
        }
    }
}

/// A stage program together with the configurations and clusters to run it on
#[derive(Debug, Clone)]
pub struct Benchmark {
    program: StageProgram,
    configurations: Vec<Configuration>,
    clusters: Vec<Cluster>,
    registry: Arc<StageRegistry>,
}

impl Benchmark {
    pub fn new(
        program: StageProgram,
        configurations: Vec<Configuration>,
        clusters: Vec<Cluster>,
        registry: Arc<StageRegistry>,
    ) -> Result<Self> {
        if configurations.is_empty() {
            return Err(ExecutionError::ConfigurationError(
                "at least one configuration is required".to_string(),
            ));
        }
        if clusters.is_empty() {
            return Err(ExecutionError::ConfigurationError(
                "at least one cluster is required".to_string(),
            ));
        }
        if let Some(cluster) = clusters.iter().find(|cluster| cluster.size() == 0) {
            return Err(ExecutionError::ConfigurationError(format!(
                "cluster {} has no workers",
                cluster
            )));
        }
        if let Some(stage) = program
            .stages()
            .iter()
            .find(|stage| !registry.contains(&stage.name))
        {
            return Err(ExecutionError::ConfigurationError(format!(
                "unknown stage '{}'",
                stage.name
            )));
        }

        Ok(Self {
            program,
            configurations,
            clusters,
            registry,
        })
    }

    pub fn program(&self) -> &StageProgram {
        &self.program
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Number of workers the largest cluster needs
    pub fn max_cluster_size(&self) -> usize {
        self.clusters.iter().map(Cluster::size).max().unwrap_or(0)
    }

    /// Run the benchmark. Connections are released whatever the outcome.
    pub async fn run(&self, connections: &mut dyn WorkerConnections) -> BenchmarkReport {
        let mut report = BenchmarkReport::new();
        let result = self.run_configurations(connections, &mut report).await;

        if let Err(e) = connections.release().await {
            warn!("Failed to release worker connections: {}", e);
        }

        if let Err(e) = result {
            let kind = e.failure_kind();
            error!("Benchmark aborted by {}: {}", kind, e);
            report.exit_code = GENERIC_ERROR_EXIT_CODE;
            report.error = Some(e.to_string());
            report.failure_kind = Some(kind.to_string());
        }
        report.finished_at = Some(Utc::now());

        if report.is_success() {
            info!("Benchmark finished successfully");
        } else {
            warn!("Benchmark finished with exit code {}", report.exit_code);
        }
        report
    }

    async fn run_configurations(
        &self,
        connections: &mut dyn WorkerConnections,
        report: &mut BenchmarkReport,
    ) -> Result<()> {
        if connections.num_workers() < self.max_cluster_size() {
            return Err(ExecutionError::ConfigurationError(format!(
                "largest cluster needs {} workers but only {} are available",
                self.max_cluster_size(),
                connections.num_workers()
            )));
        }

        connections.establish().await?;
        connections.send_scenario(&self.program).await?;

        for configuration in &self.configurations {
            info!(
                "Starting configuration {} ({}/{})",
                configuration.name,
                configuration.index,
                self.configurations.len()
            );
            connections.send_configuration(configuration).await?;

            for cluster in &self.clusters {
                info!("Running {} on cluster {}", configuration.name, cluster);
                connections.send_cluster(cluster).await?;

                let mut state = CoordinatorState::for_run(configuration.clone(), cluster.clone());
                let mut outcome = StageScheduler::new(&self.program, &self.registry, &mut *connections)
                    .run(&mut state)
                    .await;

                if let Some(e) = outcome.error.take() {
                    if e.aborts_run() {
                        return Err(e);
                    }
                    outcome.error = Some(e);
                }

                let worker_timelines = connections.receive_timelines(cluster.size()).await?;
                if outcome.failed {
                    report.record_failure(configuration);
                }
                report.runs.push(ClusterRunReport {
                    configuration: configuration.name.clone(),
                    configuration_index: configuration.index,
                    cluster: cluster.clone(),
                    failed: outcome.failed,
                    exit_requested: outcome.exit_requested,
                    error: outcome.error.as_ref().map(ToString::to_string),
                    coordinator_timeline: outcome.timeline,
                    worker_timelines,
                });

                if outcome.exit_requested {
                    warn!("A stage requested exit, skipping remaining configurations");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::LocalConnections;
    use crate::stages::{builtin_registry, LOG_STAGE};
    use async_trait::async_trait;
    use stagecoach_core::{
        DistributedStage, Stage, StageDescriptor, StageError, WorkerContext,
    };

    /// Fails on the worker when the configuration has `fail = true`
    struct Check;

    #[async_trait]
    impl DistributedStage for Check {
        fn name(&self) -> &str {
            "check"
        }

        fn exit_on_failure(&self) -> bool {
            true
        }

        async fn execute_on_worker(
            &self,
            ctx: &mut WorkerContext<'_>,
        ) -> std::result::Result<Option<serde_json::Value>, StageError> {
            let fail = ctx
                .configuration()
                .and_then(|c| c.properties.get("fail"))
                .is_some_and(|v| v == "true");
            if fail {
                return Err(StageError::failed("configured to fail"));
            }
            Ok(None)
        }
    }

    fn registry() -> Arc<StageRegistry> {
        let mut registry = builtin_registry();
        registry.register("check", |_| Ok(Stage::Distributed(Box::new(Check))));
        Arc::new(registry)
    }

    fn program() -> StageProgram {
        let mut builder = StageProgram::builder();
        builder
            .stage(StageDescriptor::new(LOG_STAGE).with_property("message", "starting"))
            .stage(StageDescriptor::new("check"));
        builder.build().unwrap()
    }

    #[test]
    fn test_validation() {
        let configurations = vec![Configuration::new("a", 1)];
        assert!(Benchmark::new(program(), vec![], vec![Cluster::of_size(1)], registry()).is_err());
        assert!(Benchmark::new(program(), configurations.clone(), vec![], registry()).is_err());
        assert!(Benchmark::new(program(), configurations.clone(), vec![Cluster::of_size(0)], registry()).is_err());

        let mut builder = StageProgram::builder();
        builder.stage(StageDescriptor::new("missing"));
        let unknown = builder.build().unwrap();
        assert!(Benchmark::new(unknown, configurations.clone(), vec![Cluster::of_size(1)], registry()).is_err());

        let benchmark = Benchmark::new(
            program(),
            configurations,
            vec![Cluster::of_size(1), Cluster::of_size(3)],
            registry(),
        )
        .unwrap();
        assert_eq!(benchmark.max_cluster_size(), 3);
    }

    #[tokio::test]
    async fn test_local_benchmark_succeeds() {
        let registry = registry();
        let benchmark = Benchmark::new(
            program(),
            vec![Configuration::new("a", 1), Configuration::new("b", 2)],
            vec![Cluster::of_size(1)],
            registry.clone(),
        )
        .unwrap();

        let mut connections = LocalConnections::new(registry);
        let report = benchmark.run(&mut connections).await;
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.runs.len(), 2);
        // check, teardown and cleanup ran on the worker
        assert_eq!(report.runs[0].worker_timelines[0].events.len(), 3);
        assert_eq!(report.runs[0].coordinator_timeline.events.len(), 4);
    }

    #[tokio::test]
    async fn test_exit_code_is_first_failing_configuration() {
        let registry = registry();
        let benchmark = Benchmark::new(
            program(),
            vec![
                Configuration::new("a", 1),
                Configuration::new("b", 2).with_property("fail", "true"),
                Configuration::new("c", 3),
            ],
            vec![Cluster::of_size(1)],
            registry.clone(),
        )
        .unwrap();

        let mut connections = LocalConnections::new(registry);
        let report = benchmark.run(&mut connections).await;
        assert_eq!(report.exit_code, 2);
        // the failing stage requests exit, so configuration c never runs
        assert_eq!(report.runs.len(), 2);
        assert!(report.runs[1].exit_requested);
    }

    #[tokio::test]
    async fn test_cluster_larger_than_worker_pool_is_rejected() {
        let registry = registry();
        let benchmark = Benchmark::new(
            program(),
            vec![Configuration::new("a", 1)],
            vec![Cluster::of_size(2)],
            registry.clone(),
        )
        .unwrap();

        let mut connections = LocalConnections::new(registry);
        let report = benchmark.run(&mut connections).await;
        assert_eq!(report.exit_code, GENERIC_ERROR_EXIT_CODE);
        assert!(report.error.is_some());
        assert_eq!(report.failure_kind.as_deref(), Some("configuration error"));
    }
}
