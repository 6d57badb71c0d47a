//! Benchmark definition: clusters, configurations and the scenario

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};

use stagecoach_core::{Cluster, Configuration, Group, StageDescriptor, StageProgram, StageProgramBuilder};

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, validate_unique_names, Validatable};

/// Benchmark definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Clusters the scenario runs on, in order
    pub clusters: Vec<ClusterConfig>,

    /// Configurations the scenario runs with, in order
    pub configurations: Vec<ConfigurationConfig>,

    /// Stages of the scenario
    pub scenario: Vec<ScenarioEntry>,

    /// Replaces the default teardown stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<StageConfig>,

    /// Replaces the default final cleanup stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<StageConfig>,
}

/// One cluster: named groups of workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub size: usize,
}

/// A named configuration with free-form properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationConfig {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Entry of the scenario list: a stage or a loop around more entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioEntry {
    Repeat { repeat: RepeatConfig },
    Stage(StageConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatConfig {
    pub name: String,
    pub times: u64,
    pub stages: Vec<ScenarioEntry>,
}

impl StageConfig {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: self.stage.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl ClusterConfig {
    pub fn size(&self) -> usize {
        self.groups.iter().map(|group| group.size).sum()
    }

    pub fn to_cluster(&self) -> Cluster {
        Cluster::new(
            self.groups
                .iter()
                .map(|group| Group::new(group.name.clone(), group.size))
                .collect(),
        )
    }
}

impl BenchmarkConfig {
    /// Whether this file defines a benchmark at all (worker-only files do not)
    pub fn is_defined(&self) -> bool {
        !self.clusters.is_empty() || !self.configurations.is_empty() || !self.scenario.is_empty()
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters.iter().map(ClusterConfig::to_cluster).collect()
    }

    /// Configurations numbered from 1 in file order
    pub fn configurations(&self) -> Vec<Configuration> {
        self.configurations
            .iter()
            .enumerate()
            .map(|(i, config)| Configuration {
                name: config.name.clone(),
                index: i + 1,
                properties: config.properties.clone(),
            })
            .collect()
    }

    /// Number of workers the largest cluster needs
    pub fn max_cluster_size(&self) -> usize {
        self.clusters.iter().map(ClusterConfig::size).max().unwrap_or(0)
    }

    /// Turn the scenario into a stage program, generating labels for loops
    pub fn build_program(&self) -> ConfigResult<StageProgram> {
        let mut builder = StageProgram::builder();
        add_entries(&mut builder, &self.scenario)?;
        if let Some(teardown) = &self.teardown {
            builder.teardown(teardown.descriptor());
        }
        if let Some(cleanup) = &self.cleanup {
            builder.cleanup(cleanup.descriptor());
        }
        Ok(builder.build()?)
    }

    fn validate_entries(&self, entries: &[ScenarioEntry], loop_names: &mut HashSet<String>) -> ConfigResult<()> {
        for entry in entries {
            match entry {
                ScenarioEntry::Stage(stage) => {
                    validate_required_string(&stage.stage, "stage name", self.domain_name())?;
                }
                ScenarioEntry::Repeat { repeat } => {
                    validate_required_string(&repeat.name, "repeat name", self.domain_name())?;
                    validate_positive(repeat.times, "repeat times", self.domain_name())?;
                    if !loop_names.insert(repeat.name.clone()) {
                        return Err(self.validation_error(format!("duplicate repeat name '{}'", repeat.name)));
                    }
                    self.validate_entries(&repeat.stages, loop_names)?;
                }
            }
        }
        Ok(())
    }
}

fn add_entries(builder: &mut StageProgramBuilder, entries: &[ScenarioEntry]) -> stagecoach_core::Result<()> {
    for entry in entries {
        match entry {
            ScenarioEntry::Stage(stage) => {
                builder.stage(stage.descriptor());
            }
            ScenarioEntry::Repeat { repeat } => {
                builder.repeat(&repeat.name, repeat.times, |b| add_entries(b, &repeat.stages))?;
            }
        }
    }
    Ok(())
}

impl Validatable for BenchmarkConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !self.is_defined() {
            return Ok(());
        }

        if self.clusters.is_empty() {
            return Err(self.validation_error("at least one cluster is required"));
        }
        for cluster in &self.clusters {
            if cluster.size() == 0 {
                return Err(self.validation_error("every cluster needs at least one worker"));
            }
            for group in &cluster.groups {
                validate_required_string(&group.name, "group name", self.domain_name())?;
            }
            validate_unique_names(
                cluster.groups.iter().map(|group| group.name.as_str()),
                "group name",
                self.domain_name(),
            )?;
        }

        if self.configurations.is_empty() {
            return Err(self.validation_error("at least one configuration is required"));
        }
        for configuration in &self.configurations {
            validate_required_string(&configuration.name, "configuration name", self.domain_name())?;
        }
        validate_unique_names(
            self.configurations.iter().map(|c| c.name.as_str()),
            "configuration name",
            self.domain_name(),
        )?;

        self.validate_entries(&self.scenario, &mut HashSet::new())
    }

    fn domain_name(&self) -> &'static str {
        "benchmark"
    }
}
