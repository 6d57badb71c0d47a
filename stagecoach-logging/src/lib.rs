//! Logging setup for Stagecoach
//!
//! Coordinator and local runs log to stdout; worker processes log to stderr
//! so their output can be told apart when the coordinator spawns them.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
