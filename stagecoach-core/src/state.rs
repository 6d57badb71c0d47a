//! Coordinator-side scenario state

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::cluster::{Cluster, Configuration};
use crate::error::{CoreError, Result};

/// Named value holding the stack of active loop names
pub const LOOP_STACK_KEY: &str = "loop.stack";

fn loop_counter_key(name: &str) -> String {
    format!("repeat.{}.counter", name)
}

/// State the coordinator keeps for one cluster run.
///
/// Stages stash named values here and read them back later; the scheduler
/// keeps the stack of active loop names in it.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorState {
    values: HashMap<String, JsonValue>,
    configuration: Option<Configuration>,
    cluster: Option<Cluster>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a run of `configuration` on `cluster`
    pub fn for_run(configuration: Configuration, cluster: Cluster) -> Self {
        Self {
            values: HashMap::new(),
            configuration: Some(configuration),
            cluster: Some(cluster),
        }
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    pub fn put(&mut self, key: impl Into<String>, value: JsonValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.values.remove(key)
    }

    /// Store any serializable value under `key`
    pub fn put_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let key = key.into();
        let json = serde_json::to_value(value).map_err(|e| CoreError::StateType {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.values.insert(key, json);
        Ok(())
    }

    /// Read the value under `key` as `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| CoreError::StateType {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn loop_stack(&self) -> Result<Vec<String>> {
        Ok(self.get_as::<Vec<String>>(LOOP_STACK_KEY)?.unwrap_or_default())
    }

    /// Enter a loop construct
    pub fn push_loop(&mut self, name: &str) -> Result<()> {
        let mut stack = self.loop_stack()?;
        stack.push(name.to_string());
        self.put_as(LOOP_STACK_KEY, &stack)
    }

    /// Leave the innermost loop construct, returning its name
    pub fn pop_loop(&mut self) -> Result<Option<String>> {
        let mut stack = self.loop_stack()?;
        let top = stack.pop();
        self.put_as(LOOP_STACK_KEY, &stack)?;
        Ok(top)
    }

    /// Name of the innermost active loop construct
    pub fn current_loop(&self) -> Result<Option<String>> {
        Ok(self.loop_stack()?.pop())
    }

    /// Completed iterations of the named loop
    pub fn loop_counter(&self, name: &str) -> Result<u64> {
        Ok(self.get_as::<u64>(&loop_counter_key(name))?.unwrap_or(0))
    }

    pub fn set_loop_counter(&mut self, name: &str, value: u64) {
        self.put(loop_counter_key(name), JsonValue::from(value));
    }

    /// Forget the iteration count so a re-entered loop starts over
    pub fn reset_loop_counter(&mut self, name: &str) {
        self.values.remove(&loop_counter_key(name));
    }
}
