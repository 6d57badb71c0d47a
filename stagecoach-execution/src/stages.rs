//! Built-in stages
//!
//! Loop constructs, teardown and cleanup, plus a few general purpose
//! stages useful in any scenario.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, info, warn};

use stagecoach_core::program::{
    CLEANUP_STAGE, LOOP_NAME_PROPERTY, LOOP_TIMES_PROPERTY, REPEAT_BEGIN_STAGE, REPEAT_END_STAGE,
    TEARDOWN_STAGE,
};
use stagecoach_core::{
    CoordinatorState, CoreError, DistributedStage, LocalStage, Stage, StageDescriptor, StageError,
    StageOutcome, StageRegistry, WorkerContext,
};

pub const LOG_STAGE: &str = "log";
pub const SLEEP_STAGE: &str = "sleep";
pub const RESTART_STAGE: &str = "restart";

/// Property shared by the distributed built-ins
pub const EXIT_ON_FAILURE_PROPERTY: &str = "exit_on_failure";

/// Register every built-in stage
pub fn register_builtins(registry: &mut StageRegistry) -> &mut StageRegistry {
    registry
        .register(REPEAT_BEGIN_STAGE, |d| Ok(Stage::Local(Box::new(RepeatBegin::from_descriptor(d)?))))
        .register(REPEAT_END_STAGE, |d| Ok(Stage::Local(Box::new(RepeatEnd::from_descriptor(d)?))))
        .register(LOG_STAGE, |d| Ok(Stage::Local(Box::new(Log::from_descriptor(d)?))))
        .register(TEARDOWN_STAGE, |d| {
            Ok(Stage::Distributed(Box::new(ScenarioDestroy::from_descriptor(d)?)))
        })
        .register(CLEANUP_STAGE, |d| {
            Ok(Stage::Distributed(Box::new(ScenarioCleanup::from_descriptor(d)?)))
        })
        .register(SLEEP_STAGE, |d| Ok(Stage::Distributed(Box::new(Sleep::from_descriptor(d)?))))
        .register(RESTART_STAGE, |d| Ok(Stage::Distributed(Box::new(Restart::from_descriptor(d)?))))
}

/// Registry holding only the built-in stages
pub fn builtin_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_builtins(&mut registry);
    registry
}

fn exit_on_failure(descriptor: &StageDescriptor) -> Result<bool, CoreError> {
    Ok(descriptor.bool_property(EXIT_ON_FAILURE_PROPERTY)?.unwrap_or(false))
}

/// Entry of a loop construct: counts iterations and breaks out once the
/// configured count is reached
#[derive(Debug)]
pub struct RepeatBegin {
    name: String,
    times: u64,
}

impl RepeatBegin {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            name: descriptor.required_str(LOOP_NAME_PROPERTY)?.to_string(),
            times: descriptor.u64_property(LOOP_TIMES_PROPERTY)?.unwrap_or(1),
        })
    }
}

#[async_trait]
impl LocalStage for RepeatBegin {
    fn name(&self) -> &str {
        REPEAT_BEGIN_STAGE
    }

    async fn execute(&self, state: &mut CoordinatorState) -> Result<StageOutcome, StageError> {
        state.push_loop(&self.name)?;
        let counter = state.loop_counter(&self.name)?;
        if counter >= self.times {
            debug!("Loop {} finished after {} iterations", self.name, counter);
            return Ok(StageOutcome::Break);
        }
        state.set_loop_counter(&self.name, counter + 1);
        debug!("Loop {} iteration {}/{}", self.name, counter + 1, self.times);
        Ok(StageOutcome::Success)
    }
}

/// Exit of a loop construct: jumps back to the matching entry
#[derive(Debug)]
pub struct RepeatEnd {
    name: String,
}

impl RepeatEnd {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            name: descriptor.required_str(LOOP_NAME_PROPERTY)?.to_string(),
        })
    }
}

#[async_trait]
impl LocalStage for RepeatEnd {
    fn name(&self) -> &str {
        REPEAT_END_STAGE
    }

    async fn execute(&self, state: &mut CoordinatorState) -> Result<StageOutcome, StageError> {
        match state.current_loop()? {
            Some(current) if current == self.name => Ok(StageOutcome::Continue),
            Some(current) => Err(StageError::failed(format!(
                "end of loop '{}' reached inside loop '{}'",
                self.name, current
            ))),
            None => Err(StageError::failed(format!(
                "end of loop '{}' reached outside of any loop",
                self.name
            ))),
        }
    }
}

/// Writes a message to the coordinator log
#[derive(Debug)]
pub struct Log {
    message: String,
}

impl Log {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            message: descriptor.required_str("message")?.to_string(),
        })
    }
}

#[async_trait]
impl LocalStage for Log {
    fn name(&self) -> &str {
        LOG_STAGE
    }

    async fn execute(&self, state: &mut CoordinatorState) -> Result<StageOutcome, StageError> {
        match (state.configuration(), state.cluster()) {
            (Some(configuration), Some(cluster)) => {
                info!("[{} on {}] {}", configuration.name, cluster, self.message)
            }
            _ => info!("{}", self.message),
        }
        Ok(StageOutcome::Success)
    }
}

/// Sleeps on every worker
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    exit_on_failure: bool,
}

impl Sleep {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            duration: Duration::from_millis(descriptor.u64_property("duration_ms")?.unwrap_or(0)),
            exit_on_failure: exit_on_failure(descriptor)?,
        })
    }
}

#[async_trait]
impl DistributedStage for Sleep {
    fn name(&self) -> &str {
        SLEEP_STAGE
    }

    fn exit_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    async fn execute_on_worker(&self, _ctx: &mut WorkerContext<'_>) -> Result<Option<JsonValue>, StageError> {
        tokio::time::sleep(self.duration).await;
        Ok(None)
    }
}

/// Replaces every worker process with a fresh one
#[derive(Debug)]
pub struct Restart {
    exit_on_failure: bool,
}

impl Restart {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            exit_on_failure: exit_on_failure(descriptor)?,
        })
    }
}

#[async_trait]
impl DistributedStage for Restart {
    fn name(&self) -> &str {
        RESTART_STAGE
    }

    fn exit_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<JsonValue>, StageError> {
        ctx.request_restart();
        Ok(None)
    }
}

/// Default teardown: drops the values stages left on the workers
#[derive(Debug)]
pub struct ScenarioDestroy {
    exit_on_failure: bool,
}

impl ScenarioDestroy {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            exit_on_failure: exit_on_failure(descriptor)?,
        })
    }
}

#[async_trait]
impl DistributedStage for ScenarioDestroy {
    fn name(&self) -> &str {
        TEARDOWN_STAGE
    }

    fn exit_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<JsonValue>, StageError> {
        let values = ctx.values();
        let cleared = values.len();
        values.clear();
        debug!("Destroyed {} worker values", cleared);
        Ok(Some(json!({ "cleared": cleared })))
    }
}

/// Default final cleanup: reports values that survived the teardown
#[derive(Debug)]
pub struct ScenarioCleanup {
    exit_on_failure: bool,
}

impl ScenarioCleanup {
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, CoreError> {
        Ok(Self {
            exit_on_failure: exit_on_failure(descriptor)?,
        })
    }
}

#[async_trait]
impl DistributedStage for ScenarioCleanup {
    fn name(&self) -> &str {
        CLEANUP_STAGE
    }

    fn exit_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    async fn execute_on_worker(&self, ctx: &mut WorkerContext<'_>) -> Result<Option<JsonValue>, StageError> {
        let worker = ctx.identity();
        let values = ctx.values();
        if !values.is_empty() {
            let mut keys: Vec<&String> = values.keys().collect();
            keys.sort();
            warn!("{} still holds values after teardown: {:?}", worker, keys);
        }
        let leaked = values.len();
        values.clear();
        Ok(Some(json!({ "leaked": leaked })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecoach_core::{Cluster, Configuration, WorkerIdentity};
    use std::collections::HashMap;

    fn loop_descriptor(stage: &str, name: &str) -> StageDescriptor {
        StageDescriptor::new(stage).with_property(LOOP_NAME_PROPERTY, name)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = builtin_registry();
        for name in [
            REPEAT_BEGIN_STAGE,
            REPEAT_END_STAGE,
            TEARDOWN_STAGE,
            CLEANUP_STAGE,
            LOG_STAGE,
            SLEEP_STAGE,
            RESTART_STAGE,
        ] {
            assert!(registry.contains(name), "missing built-in {}", name);
        }
        assert!(registry
            .instantiate(&StageDescriptor::new(TEARDOWN_STAGE))
            .unwrap()
            .is_distributed());
        assert!(!registry
            .instantiate(&loop_descriptor(REPEAT_END_STAGE, "x"))
            .unwrap()
            .is_distributed());
    }

    #[test]
    fn test_invalid_properties_rejected() {
        let registry = builtin_registry();
        assert!(registry.instantiate(&StageDescriptor::new(REPEAT_BEGIN_STAGE)).is_err());
        assert!(registry.instantiate(&StageDescriptor::new(LOG_STAGE)).is_err());
        let bad_sleep = StageDescriptor::new(SLEEP_STAGE).with_property("duration_ms", "soon");
        assert!(registry.instantiate(&bad_sleep).is_err());
    }

    #[tokio::test]
    async fn test_repeat_begin_counts_iterations() {
        let begin = RepeatBegin::from_descriptor(
            &loop_descriptor(REPEAT_BEGIN_STAGE, "x").with_property(LOOP_TIMES_PROPERTY, 2),
        )
        .unwrap();
        let mut state = CoordinatorState::new();

        assert_eq!(begin.execute(&mut state).await.unwrap(), StageOutcome::Success);
        assert_eq!(state.pop_loop().unwrap(), Some("x".to_string()));
        assert_eq!(begin.execute(&mut state).await.unwrap(), StageOutcome::Success);
        assert_eq!(state.pop_loop().unwrap(), Some("x".to_string()));
        assert_eq!(begin.execute(&mut state).await.unwrap(), StageOutcome::Break);
        assert_eq!(state.current_loop().unwrap(), Some("x".to_string()));
    }

    #[tokio::test]
    async fn test_repeat_end_requires_matching_loop() {
        let end = RepeatEnd::from_descriptor(&loop_descriptor(REPEAT_END_STAGE, "x")).unwrap();
        let mut state = CoordinatorState::new();
        assert!(end.execute(&mut state).await.is_err());

        state.push_loop("y").unwrap();
        assert!(end.execute(&mut state).await.is_err());

        state.push_loop("x").unwrap();
        assert_eq!(end.execute(&mut state).await.unwrap(), StageOutcome::Continue);
    }

    #[tokio::test]
    async fn test_teardown_clears_worker_values() {
        let configuration = Configuration::new("default", 1);
        let cluster = Cluster::of_size(1);
        let mut values = HashMap::new();
        values.insert("cache".to_string(), json!("warm"));

        let mut ctx = WorkerContext::new(
            WorkerIdentity::first_generation(0),
            0,
            Default::default(),
            Some(&configuration),
            Some(&cluster),
            &mut values,
        );
        let destroy = ScenarioDestroy::from_descriptor(&StageDescriptor::new(TEARDOWN_STAGE)).unwrap();
        let payload = destroy.execute_on_worker(&mut ctx).await.unwrap();
        assert_eq!(payload, Some(json!({ "cleared": 1 })));

        let cleanup = ScenarioCleanup::from_descriptor(&StageDescriptor::new(CLEANUP_STAGE)).unwrap();
        let payload = cleanup.execute_on_worker(&mut ctx).await.unwrap();
        assert_eq!(payload, Some(json!({ "leaked": 0 })));
        drop(ctx);
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_restart_requests_restart() {
        let mut values = HashMap::new();
        let mut ctx = WorkerContext::new(
            WorkerIdentity::first_generation(3),
            1,
            Default::default(),
            None,
            None,
            &mut values,
        );
        let restart = Restart::from_descriptor(
            &StageDescriptor::new(RESTART_STAGE).with_property(EXIT_ON_FAILURE_PROPERTY, true),
        )
        .unwrap();
        assert!(restart.exit_on_failure());
        restart.execute_on_worker(&mut ctx).await.unwrap();
        assert!(ctx.restart_requested());
    }
}
