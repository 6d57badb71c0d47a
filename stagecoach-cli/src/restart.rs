//! Worker restarts by re-executing the current binary

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use stagecoach_core::WorkerIdentity;
use stagecoach_execution::{ExecutionError, WorkerRestarter};

/// Starts a fresh `stagecoach worker` process that rejoins under the same index
pub struct ProcessRestarter {
    host: String,
    port: u16,
    config: Option<PathBuf>,
    log_level: Option<String>,
}

impl ProcessRestarter {
    pub fn new(host: String, port: u16, config: Option<PathBuf>, log_level: Option<String>) -> Self {
        Self {
            host,
            port,
            config,
            log_level,
        }
    }

    /// Arguments for the replacement process
    fn arguments(&self, identity: WorkerIdentity) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        args.extend([
            "worker".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--index".to_string(),
            identity.index.to_string(),
            "--generation".to_string(),
            identity.generation.as_uuid().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl WorkerRestarter for ProcessRestarter {
    async fn spawn_replacement(&self, identity: WorkerIdentity) -> stagecoach_execution::Result<()> {
        let current_exe = std::env::current_exe().map_err(|e| ExecutionError::RestartFailed {
            worker: identity.index,
            message: format!("Failed to get current exe: {}", e),
        })?;

        let args = self.arguments(identity);
        debug!("Spawning {:?} {:?}", current_exe, args);

        // The replacement outlives this process, so it is not killed on drop
        let child = Command::new(&current_exe)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| ExecutionError::RestartFailed {
                worker: identity.index,
                message: format!("Failed to spawn worker: {}", e),
            })?;

        info!(
            "Started replacement for {} (pid {:?})",
            identity,
            child.id()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecoach_core::GenerationToken;

    #[test]
    fn test_replacement_arguments() {
        let restarter = ProcessRestarter::new(
            "127.0.0.1".to_string(),
            2103,
            Some(PathBuf::from("bench.yaml")),
            None,
        );
        let generation = GenerationToken::generate();
        let args = restarter.arguments(WorkerIdentity::new(3, generation));

        assert_eq!(
            args,
            vec![
                "--config".to_string(),
                "bench.yaml".to_string(),
                "worker".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                "2103".to_string(),
                "--index".to_string(),
                "3".to_string(),
                "--generation".to_string(),
                generation.as_uuid().to_string(),
            ]
        );
    }
}
