//! Benchmark execution for Stagecoach
//!
//! This crate drives a stage program across a set of workers. The
//! coordinator side consists of the connection managers (remote TCP
//! workers or a single in-process worker), the stage scheduler and the
//! benchmark outer loop; the worker side is the [`WorkerRuntime`] stage
//! loop.

pub mod benchmark;
pub mod connections;
pub mod error;
pub mod scheduler;
pub mod stages;
pub mod worker;

pub use benchmark::{Benchmark, BenchmarkReport, ClusterRunReport, GENERIC_ERROR_EXIT_CODE};
pub use connections::{LocalConnections, RemoteConnections, RemoteConnectionsConfig, WorkerConnections};
pub use error::{ExecutionError, Result};
pub use scheduler::{resolve_transition, ClusterRunOutcome, StageScheduler, Transition};
pub use stages::{builtin_registry, register_builtins};
pub use worker::{WorkerExit, WorkerRestarter, WorkerRuntime};
