//! Stage traits and the stage registry
//!
//! Stage implementations are external to the coordination protocol: the
//! scheduler only sees the hooks defined here. A stage is either local
//! (runs on the coordinator only) or distributed (runs on every worker of
//! the active cluster, with the acknowledgements reduced on the
//! coordinator).

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::ack::Ack;
use crate::cluster::{Cluster, Configuration};
use crate::error::{CoreError, Result, StageError};
use crate::identity::WorkerIdentity;
use crate::outcome::StageOutcome;
use crate::program::StageDescriptor;
use crate::state::CoordinatorState;

/// Auxiliary data the coordinator sends along with a stage id
pub type AuxiliaryData = Map<String, JsonValue>;

/// Stage that runs on the coordinator only
#[async_trait]
pub trait LocalStage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, state: &mut CoordinatorState) -> std::result::Result<StageOutcome, StageError>;
}

/// Stage that runs on every worker of the active cluster
#[async_trait]
pub trait DistributedStage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failed reduction should abort all remaining configurations
    fn exit_on_failure(&self) -> bool {
        false
    }

    /// Prepare coordinator-side state before dispatch
    fn init_on_coordinator(&mut self, _state: &mut CoordinatorState) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// Data sent to every worker along with the stage id
    fn create_auxiliary_data(&self, _state: &CoordinatorState) -> AuxiliaryData {
        AuxiliaryData::new()
    }

    /// Worker-side hook; the returned value becomes the ack payload
    async fn execute_on_worker(
        &self,
        ctx: &mut WorkerContext<'_>,
    ) -> std::result::Result<Option<JsonValue>, StageError>;

    /// Fold the acks, sorted by worker index, into one outcome
    fn reduce_acks(&self, _state: &mut CoordinatorState, acks: &[Ack]) -> StageOutcome {
        reduce_acks_default(self.name(), acks, self.exit_on_failure())
    }
}

/// Reduction used when a stage does not supply its own:
/// any error ack fails the stage.
pub fn reduce_acks_default(stage_name: &str, acks: &[Ack], exit_on_failure: bool) -> StageOutcome {
    let mut failed = false;
    for ack in acks.iter().filter(|ack| ack.is_error()) {
        warn!(
            "Stage {} failed on {}: {}",
            stage_name,
            ack.worker,
            ack.error_message.as_deref().unwrap_or("no error message")
        );
        failed = true;
    }

    match (failed, exit_on_failure) {
        (false, _) => StageOutcome::Success,
        (true, false) => StageOutcome::Fail,
        (true, true) => StageOutcome::Exit,
    }
}

/// An instantiated stage
pub enum Stage {
    Local(Box<dyn LocalStage>),
    Distributed(Box<dyn DistributedStage>),
}

impl Stage {
    pub fn is_distributed(&self) -> bool {
        matches!(self, Stage::Distributed(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Stage::Local(stage) => stage.name(),
            Stage::Distributed(stage) => stage.name(),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Local(stage) => write!(f, "Stage::Local({})", stage.name()),
            Stage::Distributed(stage) => write!(f, "Stage::Distributed({})", stage.name()),
        }
    }
}

/// Context handed to a distributed stage on the worker
pub struct WorkerContext<'a> {
    identity: WorkerIdentity,
    stage_id: usize,
    data: AuxiliaryData,
    configuration: Option<&'a Configuration>,
    cluster: Option<&'a Cluster>,
    values: &'a mut HashMap<String, JsonValue>,
    restart_requested: bool,
}

impl<'a> WorkerContext<'a> {
    pub fn new(
        identity: WorkerIdentity,
        stage_id: usize,
        data: AuxiliaryData,
        configuration: Option<&'a Configuration>,
        cluster: Option<&'a Cluster>,
        values: &'a mut HashMap<String, JsonValue>,
    ) -> Self {
        Self {
            identity,
            stage_id,
            data,
            configuration,
            cluster,
            values,
            restart_requested: false,
        }
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub fn worker_index(&self) -> usize {
        self.identity.index
    }

    pub fn stage_id(&self) -> usize {
        self.stage_id
    }

    /// Auxiliary data sent by the coordinator
    pub fn data(&self) -> &AuxiliaryData {
        &self.data
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration
    }

    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster
    }

    /// Worker-local values that survive across stages
    pub fn values(&mut self) -> &mut HashMap<String, JsonValue> {
        self.values
    }

    /// Ask the runtime to replace this worker process after the ack is sent
    pub fn request_restart(&mut self) {
        self.restart_requested = true;
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }
}

/// Factory building a stage from its descriptor
pub type StageFactory = Arc<dyn Fn(&StageDescriptor) -> Result<Stage> + Send + Sync>;

/// Name to factory table shared by the coordinator and the workers
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StageDescriptor) -> Result<Stage> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the stage a descriptor names
    pub fn instantiate(&self, descriptor: &StageDescriptor) -> Result<Stage> {
        let factory = self
            .factories
            .get(&descriptor.name)
            .ok_or_else(|| CoreError::UnknownStage(descriptor.name.clone()))?;
        factory(descriptor)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl LocalStage for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _state: &mut CoordinatorState) -> std::result::Result<StageOutcome, StageError> {
            Ok(StageOutcome::Success)
        }
    }

    #[test]
    fn test_registry_instantiate() {
        let mut registry = StageRegistry::new();
        registry.register("noop", |_| Ok(Stage::Local(Box::new(Noop))));

        let stage = registry.instantiate(&StageDescriptor::new("noop")).unwrap();
        assert!(!stage.is_distributed());
        assert_eq!(stage.name(), "noop");

        let missing = registry.instantiate(&StageDescriptor::new("missing"));
        assert!(matches!(missing, Err(CoreError::UnknownStage(name)) if name == "missing"));
    }

    #[test]
    fn test_default_reduction() {
        let w0 = WorkerIdentity::first_generation(0);
        let w1 = WorkerIdentity::first_generation(1);
        let ok = vec![
            Ack::success(w0, 0, Duration::ZERO, None),
            Ack::success(w1, 0, Duration::ZERO, None),
        ];
        assert_eq!(reduce_acks_default("s", &ok, false), StageOutcome::Success);

        let mixed = vec![
            Ack::success(w0, 0, Duration::ZERO, None),
            Ack::failure(w1, 0, "broken", Duration::ZERO),
        ];
        assert_eq!(reduce_acks_default("s", &mixed, false), StageOutcome::Fail);
        assert_eq!(reduce_acks_default("s", &mixed, true), StageOutcome::Exit);
    }

    #[test]
    fn test_worker_context_restart_flag() {
        let mut values = HashMap::new();
        let mut ctx = WorkerContext::new(
            WorkerIdentity::first_generation(0),
            3,
            AuxiliaryData::new(),
            None,
            None,
            &mut values,
        );
        assert!(!ctx.restart_requested());
        ctx.values().insert("k".to_string(), JsonValue::Bool(true));
        ctx.request_restart();
        assert!(ctx.restart_requested());
        assert_eq!(ctx.stage_id(), 3);
        assert_eq!(values.get("k"), Some(&JsonValue::Bool(true)));
    }
}
