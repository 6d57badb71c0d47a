//! Domain-specific configuration modules

pub mod benchmark;
pub mod coordinator;
pub mod logging;
pub mod utils;
pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Main Stagecoach configuration combining all domains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagecoachConfig {
    pub coordinator: coordinator::CoordinatorConfig,

    pub worker: worker::WorkerConfig,

    pub logging: logging::LoggingConfig,

    pub benchmark: benchmark::BenchmarkConfig,
}

impl StagecoachConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.coordinator.validate()?;
        self.worker.validate()?;
        self.logging.validate()?;
        self.benchmark.validate()?;
        Ok(())
    }

    /// Configuration with a small example benchmark
    pub fn sample() -> Self {
        use benchmark::*;

        let benchmark = BenchmarkConfig {
            clusters: vec![ClusterConfig {
                groups: vec![GroupConfig {
                    name: "default".to_string(),
                    size: 1,
                }],
            }],
            configurations: vec![ConfigurationConfig {
                name: "default".to_string(),
                properties: Default::default(),
            }],
            scenario: vec![
                ScenarioEntry::Stage(StageConfig::new("log").with_property("message", "starting benchmark")),
                ScenarioEntry::Repeat {
                    repeat: RepeatConfig {
                        name: "warmup".to_string(),
                        times: 3,
                        stages: vec![ScenarioEntry::Stage(
                            StageConfig::new("sleep").with_property("duration_ms", json!(100)),
                        )],
                    },
                },
            ],
            teardown: None,
            cleanup: None,
        };

        Self {
            benchmark,
            ..Default::default()
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        serde_yaml::to_string(&Self::sample())
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_round_trips_and_validates() {
        let yaml = StagecoachConfig::generate_sample();
        let parsed: StagecoachConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, StagecoachConfig::sample());
        parsed.validate_all().unwrap();
        assert_eq!(parsed.benchmark.build_program().unwrap().len(), 6);
    }
}
