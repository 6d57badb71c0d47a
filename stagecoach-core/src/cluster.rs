//! Clusters and benchmark configurations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named group of workers inside a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub size: usize,
}

impl Group {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// The set of workers participating in one scenario run.
///
/// Workers are assigned to groups in index order: the first group owns
/// indices `0..size`, the next group continues from there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub groups: Vec<Group>,
}

impl Cluster {
    pub fn new(groups: Vec<Group>) -> Self {
        Self { groups }
    }

    /// Cluster with a single default group
    pub fn of_size(size: usize) -> Self {
        Self::new(vec![Group::new("default", size)])
    }

    /// Total number of workers in the cluster
    pub fn size(&self) -> usize {
        self.groups.iter().map(|g| g.size).sum()
    }

    /// Group a worker index belongs to
    pub fn group_of(&self, worker_index: usize) -> Option<&Group> {
        let mut start = 0;
        for group in &self.groups {
            if worker_index < start + group.size {
                return Some(group);
            }
            start += group.size;
        }
        None
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .groups
            .iter()
            .map(|g| format!("{}={}", g.name, g.size))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// One benchmark configuration, identified by name and 1-based position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub index: usize,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
