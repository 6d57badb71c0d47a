//! Core domain models and types for Stagecoach
//!
//! This crate contains the fundamental types shared by the coordinator and
//! the worker processes: the stage program, stage outcomes, worker
//! identities, acknowledgements, and the traits stage implementations
//! plug into. It has minimal dependencies and defines the domain language
//! of the benchmark run.

pub mod ack;
pub mod cluster;
pub mod error;
pub mod identity;
pub mod outcome;
pub mod program;
pub mod stage;
pub mod state;
pub mod timeline;

// Re-export commonly used types at the crate root
pub use ack::Ack;
pub use cluster::{Cluster, Configuration, Group};
pub use error::{CoreError, Result, StageError};
pub use identity::{GenerationToken, WorkerIdentity};
pub use outcome::StageOutcome;
pub use program::{StageDescriptor, StageProgram, StageProgramBuilder};
pub use stage::{
    reduce_acks_default, AuxiliaryData, DistributedStage, LocalStage, Stage, StageFactory,
    StageRegistry, WorkerContext,
};
pub use state::CoordinatorState;
pub use timeline::{Timeline, TimelineEvent};
