//! Worker process configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domains::utils::{default_port, serde_duration_millis};
use crate::error::ConfigResult;
use crate::validation::{validate_port_range, validate_positive, validate_required_string, Validatable};

/// Where a worker finds its coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub coordinator_host: String,

    pub coordinator_port: u16,

    /// Connection attempts before giving up
    pub connect_attempts: u32,

    #[serde(with = "serde_duration_millis")]
    pub connect_retry_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_host: "127.0.0.1".to_string(),
            coordinator_port: default_port(),
            connect_attempts: 30,
            connect_retry_interval: Duration::from_millis(1000),
        }
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.coordinator_host, "coordinator_host", self.domain_name())?;
        validate_port_range(self.coordinator_port, "coordinator_port", self.domain_name())?;
        validate_positive(self.connect_attempts, "connect_attempts", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}
