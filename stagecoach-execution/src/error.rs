//! Error types for benchmark execution

use stagecoach_core::CoreError;
use stagecoach_ipc::IpcError;
use thiserror::Error;

/// Execution errors, grouped by how the benchmark reacts to them
#[derive(Error, Debug)]
pub enum ExecutionError {
    // Setup errors: fatal for the whole run
    #[error("Failed to bind coordinator socket on {address}: {message}")]
    Bind { address: String, message: String },

    #[error("Discovery timed out with {connected} of {expected} workers connected")]
    DiscoveryTimeout { connected: usize, expected: usize },

    #[error("Timed out waiting for {pending} restarting workers to reconnect")]
    ReconnectTimeout { pending: usize },

    #[error("Rejected worker handshake from {peer}: {reason}")]
    HandshakeRejected { peer: String, reason: String },

    // Protocol errors: contract violations, never retried
    #[error("Multicast requested while worker {worker} still has unsent bytes")]
    MulticastInProgress { worker: usize },

    #[error("Protocol violation by worker {worker}: {message}")]
    ProtocolViolation { worker: usize, message: String },

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    // Worker failures
    #[error("Worker {worker} disconnected unexpectedly: {reason}")]
    WorkerDisconnected { worker: usize, reason: String },

    #[error("Worker {worker} is not connected")]
    NotConnected { worker: usize },

    #[error("Failed to start replacement for worker {worker}: {message}")]
    RestartFailed { worker: usize, message: String },

    // Scenario-level errors: fail the current cluster run only
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Loop control error: {0}")]
    LoopControl(String),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Invalid execution state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type alias for execution operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

impl ExecutionError {
    /// Errors raised while assembling the cluster
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::Bind { .. }
                | ExecutionError::DiscoveryTimeout { .. }
                | ExecutionError::ReconnectTimeout { .. }
                | ExecutionError::HandshakeRejected { .. }
        )
    }

    /// Violations of the coordinator/worker contract
    pub fn is_protocol_error(&self) -> bool {
        match self {
            ExecutionError::MulticastInProgress { .. } | ExecutionError::ProtocolViolation { .. } => true,
            ExecutionError::Ipc(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// A worker is gone
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkerDisconnected { .. }
                | ExecutionError::NotConnected { .. }
                | ExecutionError::RestartFailed { .. }
        )
    }

    /// Short label for the failure class, used in logs and reports
    pub fn failure_kind(&self) -> &'static str {
        if self.is_setup_error() {
            "setup error"
        } else if self.is_protocol_error() {
            "protocol error"
        } else if self.is_worker_failure() {
            "worker failure"
        } else {
            match self {
                ExecutionError::LoopControl(_) => "loop-control error",
                ExecutionError::ConfigurationError(_) => "configuration error",
                ExecutionError::Stage { .. } => "stage error",
                _ => "execution error",
            }
        }
    }

    /// Whether the error aborts the whole benchmark rather than the current cluster run
    pub fn aborts_run(&self) -> bool {
        !matches!(
            self,
            ExecutionError::Stage { .. } | ExecutionError::LoopControl(_) | ExecutionError::Core(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = ExecutionError::DiscoveryTimeout {
            connected: 1,
            expected: 3,
        };
        assert!(timeout.is_setup_error());
        assert!(timeout.aborts_run());

        let multicast = ExecutionError::MulticastInProgress { worker: 0 };
        assert!(multicast.is_protocol_error());
        assert!(multicast.aborts_run());

        let frame: ExecutionError = IpcError::InvalidFrameLength(-1).into();
        assert!(frame.is_protocol_error());

        let gone = ExecutionError::WorkerDisconnected {
            worker: 2,
            reason: "connection closed".to_string(),
        };
        assert!(gone.is_worker_failure());
        assert!(gone.aborts_run());

        let stage = ExecutionError::Stage {
            stage: "log".to_string(),
            message: "boom".to_string(),
        };
        assert!(!stage.aborts_run());
        assert!(!ExecutionError::LoopControl("BREAK outside of any loop".to_string()).aborts_run());
    }

    #[test]
    fn test_failure_kind() {
        let rejected = ExecutionError::HandshakeRejected {
            peer: "127.0.0.1:4000".to_string(),
            reason: "slot 0 is already held".to_string(),
        };
        assert_eq!(rejected.failure_kind(), "setup error");
        assert_eq!(
            ExecutionError::MulticastInProgress { worker: 1 }.failure_kind(),
            "protocol error"
        );
        assert_eq!(ExecutionError::NotConnected { worker: 0 }.failure_kind(), "worker failure");
        assert_eq!(
            ExecutionError::LoopControl("undefined label".to_string()).failure_kind(),
            "loop-control error"
        );
        assert_eq!(
            ExecutionError::ConfigurationError("no clusters".to_string()).failure_kind(),
            "configuration error"
        );
        // non-fatal codec errors are not protocol violations
        let closed: ExecutionError = IpcError::ConnectionClosed.into();
        assert_eq!(closed.failure_kind(), "execution error");
    }
}
