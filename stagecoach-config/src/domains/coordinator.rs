//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domains::utils::{default_port, default_timeout, serde_duration};
use crate::error::ConfigResult;
use crate::validation::{validate_port_range, validate_positive, validate_required_string, Validatable};

/// Coordinator socket and discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address to bind the coordinator socket to
    pub bind_address: String,

    pub port: u16,

    /// How long to wait for all workers to connect
    #[serde(with = "serde_duration")]
    pub discovery_timeout: Duration,

    /// How long to wait for restarted workers to rejoin
    #[serde(with = "serde_duration")]
    pub reconnect_timeout: Duration,

    /// How long a connecting peer may take to send its handshake request
    #[serde(with = "serde_duration")]
    pub handshake_timeout: Duration,

    /// Largest accepted frame payload in bytes
    pub max_frame_length: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: default_port(),
            discovery_timeout: default_timeout(),
            reconnect_timeout: default_timeout(),
            handshake_timeout: Duration::from_secs(10),
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

impl Validatable for CoordinatorConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.bind_address, "bind_address", self.domain_name())?;
        validate_port_range(self.port, "port", self.domain_name())?;
        validate_positive(self.discovery_timeout.as_secs(), "discovery_timeout", self.domain_name())?;
        validate_positive(self.reconnect_timeout.as_secs(), "reconnect_timeout", self.domain_name())?;
        validate_positive(self.handshake_timeout.as_secs(), "handshake_timeout", self.domain_name())?;
        validate_positive(self.max_frame_length, "max_frame_length", self.domain_name())?;
        if self.max_frame_length > i32::MAX as usize {
            return Err(self.validation_error(format!(
                "max_frame_length cannot exceed {} bytes",
                i32::MAX
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "coordinator"
    }
}
