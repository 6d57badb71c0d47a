//! Stage programs: the ordered stages of a scenario plus the loop label table

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};

use crate::error::{CoreError, Result};

/// Stage that opens a loop construct
pub const REPEAT_BEGIN_STAGE: &str = "repeat-begin";
/// Stage that closes a loop construct
pub const REPEAT_END_STAGE: &str = "repeat-end";
/// Always-run teardown stage appended by the builder
pub const TEARDOWN_STAGE: &str = "scenario-destroy";
/// Always-run final cleanup stage appended by the builder
pub const CLEANUP_STAGE: &str = "scenario-cleanup";

/// Property holding the loop name on repeat stages
pub const LOOP_NAME_PROPERTY: &str = "name";
/// Property holding the iteration count on `repeat-begin`
pub const LOOP_TIMES_PROPERTY: &str = "times";

/// Label the scheduler jumps to on `CONTINUE`
pub fn loop_begin_label(name: &str) -> String {
    format!("repeat.{}.begin", name)
}

/// Label the scheduler jumps to on `BREAK`
pub fn loop_end_label(name: &str) -> String {
    format!("repeat.{}.end", name)
}

/// Description of one stage: the registered stage name plus its properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&JsonValue> {
        self.properties.get(key)
    }

    /// Read a string property
    pub fn str_property(&self, key: &str) -> Result<Option<&str>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.property_error(key, format!("expected a string, got {}", other))),
        }
    }

    /// Read an unsigned integer property (numbers or numeric strings)
    pub fn u64_property(&self, key: &str) -> Result<Option<u64>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(JsonValue::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.property_error(key, format!("expected an unsigned integer, got {}", n))),
            Some(JsonValue::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|e| self.property_error(key, format!("'{}': {}", s, e))),
            Some(other) => Err(self.property_error(key, format!("expected an integer, got {}", other))),
        }
    }

    /// Read a boolean property (booleans or "true"/"false" strings)
    pub fn bool_property(&self, key: &str) -> Result<Option<bool>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(JsonValue::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|e| self.property_error(key, format!("'{}': {}", s, e))),
            Some(other) => Err(self.property_error(key, format!("expected a boolean, got {}", other))),
        }
    }

    /// Read a string property that must be present
    pub fn required_str(&self, key: &str) -> Result<&str> {
        self.str_property(key)?
            .ok_or_else(|| self.property_error(key, "missing required property"))
    }

    fn property_error(&self, key: &str, message: impl Into<String>) -> CoreError {
        CoreError::InvalidProperty {
            stage: self.name.clone(),
            property: key.to_string(),
            message: message.into(),
        }
    }
}

/// The immutable program of a scenario.
///
/// The last two stages are the always-run teardown and final cleanup; the
/// scheduler executes them even when earlier stages fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgram {
    stages: Vec<StageDescriptor>,
    labels: BTreeMap<String, usize>,
}

impl StageProgram {
    /// Create a program from raw parts.
    ///
    /// The last two descriptors are taken as teardown and cleanup. Labels
    /// may point at any stage up to and including the teardown index.
    pub fn new(stages: Vec<StageDescriptor>, labels: BTreeMap<String, usize>) -> Result<Self> {
        if stages.len() < 2 {
            return Err(CoreError::InvalidProgram(format!(
                "a program needs teardown and cleanup stages, got {} stages",
                stages.len()
            )));
        }
        let teardown = stages.len() - 2;
        for (label, index) in &labels {
            if *index > teardown {
                return Err(CoreError::InvalidProgram(format!(
                    "label '{}' points at stage {} beyond teardown ({})",
                    label, index, teardown
                )));
            }
        }
        Ok(Self { stages, labels })
    }

    pub fn builder() -> StageProgramBuilder {
        StageProgramBuilder::new()
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Result<&StageDescriptor> {
        self.stages.get(index).ok_or(CoreError::StageOutOfRange {
            index,
            len: self.stages.len(),
        })
    }

    /// Index of the always-run teardown stage
    pub fn teardown_index(&self) -> usize {
        self.stages.len() - 2
    }

    /// Index of the always-run final cleanup stage
    pub fn cleanup_index(&self) -> usize {
        self.stages.len() - 1
    }

    /// Resolve a label to a stage index
    pub fn label(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    pub fn labels(&self) -> &BTreeMap<String, usize> {
        &self.labels
    }
}

/// Incremental builder for [`StageProgram`]
#[derive(Debug)]
pub struct StageProgramBuilder {
    stages: Vec<StageDescriptor>,
    labels: BTreeMap<String, usize>,
    open_loops: Vec<String>,
    loop_names: HashSet<String>,
    teardown: StageDescriptor,
    cleanup: StageDescriptor,
}

impl Default for StageProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StageProgramBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            labels: BTreeMap::new(),
            open_loops: Vec::new(),
            loop_names: HashSet::new(),
            teardown: StageDescriptor::new(TEARDOWN_STAGE),
            cleanup: StageDescriptor::new(CLEANUP_STAGE),
        }
    }

    /// Append a stage
    pub fn stage(&mut self, descriptor: StageDescriptor) -> &mut Self {
        self.stages.push(descriptor);
        self
    }

    /// Replace the teardown stage appended at build time
    pub fn teardown(&mut self, descriptor: StageDescriptor) -> &mut Self {
        self.teardown = descriptor;
        self
    }

    /// Replace the cleanup stage appended at build time
    pub fn cleanup(&mut self, descriptor: StageDescriptor) -> &mut Self {
        self.cleanup = descriptor;
        self
    }

    /// Open a loop construct executed `times` times
    pub fn begin_repeat(&mut self, name: &str, times: u64) -> Result<&mut Self> {
        if name.is_empty() {
            return Err(CoreError::InvalidProgram("loop name cannot be empty".to_string()));
        }
        if !self.loop_names.insert(name.to_string()) {
            return Err(CoreError::InvalidProgram(format!("duplicate loop name '{}'", name)));
        }
        self.labels.insert(loop_begin_label(name), self.stages.len());
        self.stages.push(
            StageDescriptor::new(REPEAT_BEGIN_STAGE)
                .with_property(LOOP_NAME_PROPERTY, name)
                .with_property(LOOP_TIMES_PROPERTY, times),
        );
        self.open_loops.push(name.to_string());
        Ok(self)
    }

    /// Close the innermost open loop construct
    pub fn end_repeat(&mut self) -> Result<&mut Self> {
        let name = self
            .open_loops
            .pop()
            .ok_or_else(|| CoreError::InvalidProgram("end of loop without a matching begin".to_string()))?;
        self.stages
            .push(StageDescriptor::new(REPEAT_END_STAGE).with_property(LOOP_NAME_PROPERTY, name.as_str()));
        self.labels.insert(loop_end_label(&name), self.stages.len());
        Ok(self)
    }

    /// Add a complete loop construct around the stages `body` appends
    pub fn repeat<F>(&mut self, name: &str, times: u64, body: F) -> Result<&mut Self>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.begin_repeat(name, times)?;
        body(self)?;
        self.end_repeat()
    }

    /// Finish the program, appending teardown and cleanup
    pub fn build(self) -> Result<StageProgram> {
        if let Some(name) = self.open_loops.last() {
            return Err(CoreError::InvalidProgram(format!("loop '{}' is never closed", name)));
        }
        let mut stages = self.stages;
        stages.push(self.teardown);
        stages.push(self.cleanup);
        StageProgram::new(stages, self.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_appends_teardown_and_cleanup() {
        let mut builder = StageProgram::builder();
        builder.stage(StageDescriptor::new("a"));
        let program = builder.build().unwrap();

        assert_eq!(program.len(), 3);
        assert_eq!(program.teardown_index(), 1);
        assert_eq!(program.cleanup_index(), 2);
        assert_eq!(program.stage(1).unwrap().name, TEARDOWN_STAGE);
        assert_eq!(program.stage(2).unwrap().name, CLEANUP_STAGE);
    }

    #[test]
    fn test_repeat_labels() {
        let mut builder = StageProgram::builder();
        builder.stage(StageDescriptor::new("setup"));
        builder
            .repeat("x", 3, |b| {
                b.stage(StageDescriptor::new("work"));
                Ok(())
            })
            .unwrap();
        builder.stage(StageDescriptor::new("after"));
        let program = builder.build().unwrap();

        // setup, repeat-begin, work, repeat-end, after, teardown, cleanup
        assert_eq!(program.len(), 7);
        assert_eq!(program.label("repeat.x.begin"), Some(1));
        assert_eq!(program.label("repeat.x.end"), Some(4));
        assert_eq!(program.stage(1).unwrap().name, REPEAT_BEGIN_STAGE);
        assert_eq!(program.stage(3).unwrap().name, REPEAT_END_STAGE);
        assert_eq!(
            program.stage(1).unwrap().u64_property(LOOP_TIMES_PROPERTY).unwrap(),
            Some(3)
        );
    }

    #[test]
    fn test_unclosed_and_duplicate_loops_rejected() {
        let mut builder = StageProgram::builder();
        builder.begin_repeat("x", 1).unwrap();
        assert!(builder.build().is_err());

        let mut builder = StageProgram::builder();
        builder.repeat("x", 1, |_| Ok(())).unwrap();
        assert!(builder.begin_repeat("x", 2).is_err());

        let mut builder = StageProgram::builder();
        assert!(builder.end_repeat().is_err());
    }

    #[test]
    fn test_program_requires_trailing_stages() {
        let result = StageProgram::new(vec![StageDescriptor::new("only")], BTreeMap::new());
        assert!(matches!(result, Err(CoreError::InvalidProgram(_))));
    }

    #[test]
    fn test_label_beyond_teardown_rejected() {
        let stages = vec![
            StageDescriptor::new("a"),
            StageDescriptor::new(TEARDOWN_STAGE),
            StageDescriptor::new(CLEANUP_STAGE),
        ];
        let mut labels = BTreeMap::new();
        labels.insert("repeat.x.end".to_string(), 2);
        assert!(StageProgram::new(stages, labels).is_err());
    }

    #[test]
    fn test_descriptor_properties() {
        let descriptor = StageDescriptor::new("sleep")
            .with_property("duration_ms", "250")
            .with_property("exit_on_failure", true)
            .with_property("message", 5);

        assert_eq!(descriptor.u64_property("duration_ms").unwrap(), Some(250));
        assert_eq!(descriptor.bool_property("exit_on_failure").unwrap(), Some(true));
        assert_eq!(descriptor.u64_property("missing").unwrap(), None);
        assert!(descriptor.str_property("message").is_err());
        assert!(descriptor.required_str("missing").is_err());
    }
}
