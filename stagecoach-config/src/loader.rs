//! Configuration loading and environment variable handling

use crate::domains::StagecoachConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "STAGECOACH".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<StagecoachConfig> {
        let path = path.as_ref();
        tracing::debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let mut config: StagecoachConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<StagecoachConfig> {
        let mut config = StagecoachConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load from a file when one is given, otherwise from the environment
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<StagecoachConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut StagecoachConfig) -> ConfigResult<()> {
        self.apply_coordinator_overrides(&mut config.coordinator)?;
        self.apply_worker_overrides(&mut config.worker)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_coordinator_overrides(
        &self,
        config: &mut crate::domains::coordinator::CoordinatorConfig,
    ) -> ConfigResult<()> {
        if let Ok(bind) = self.get_env_var("BIND_ADDRESS") {
            config.bind_address = bind;
        }

        if let Ok(port) = self.get_env_var("PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PORT: {}", e)))?;
        }

        if let Ok(timeout) = self.get_env_var("DISCOVERY_TIMEOUT") {
            config.discovery_timeout = parse_seconds("DISCOVERY_TIMEOUT", &timeout)?;
        }

        if let Ok(timeout) = self.get_env_var("RECONNECT_TIMEOUT") {
            config.reconnect_timeout = parse_seconds("RECONNECT_TIMEOUT", &timeout)?;
        }

        if let Ok(timeout) = self.get_env_var("HANDSHAKE_TIMEOUT") {
            config.handshake_timeout = parse_seconds("HANDSHAKE_TIMEOUT", &timeout)?;
        }

        Ok(())
    }

    fn apply_worker_overrides(&self, config: &mut crate::domains::worker::WorkerConfig) -> ConfigResult<()> {
        if let Ok(host) = self.get_env_var("COORDINATOR_HOST") {
            config.coordinator_host = host;
        }

        if let Ok(port) = self.get_env_var("COORDINATOR_PORT") {
            config.coordinator_port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid COORDINATOR_PORT: {}", e)))?;
        }

        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut crate::domains::logging::LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_seconds(name: &str, value: &str) -> ConfigResult<Duration> {
    let seconds: u64 = value
        .parse()
        .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
    Ok(Duration::from_secs(seconds))
}
