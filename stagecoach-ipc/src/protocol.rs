//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stagecoach_core::{Ack, AuxiliaryData, Cluster, Configuration, StageProgram, Timeline};

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the coordinator to worker processes.
///
/// Shutdown is not a variant: it is signalled by an empty frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorCommand {
    /// The program of stages for the whole benchmark
    Scenario { program: StageProgram },

    /// The configuration about to be benchmarked
    Configuration { configuration: Configuration },

    /// The cluster about to run the scenario
    Cluster { cluster: Cluster },

    /// Execute one stage
    RunStage { stage_id: usize, data: AuxiliaryData },

    /// Report and clear the recorded timeline
    CollectTimeline,
}

impl CoordinatorCommand {
    /// Whether the worker answers this command
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            CoordinatorCommand::RunStage { .. } | CoordinatorCommand::CollectTimeline
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorCommand::Scenario { .. } => "scenario",
            CoordinatorCommand::Configuration { .. } => "configuration",
            CoordinatorCommand::Cluster { .. } => "cluster",
            CoordinatorCommand::RunStage { .. } => "run_stage",
            CoordinatorCommand::CollectTimeline => "collect_timeline",
        }
    }
}

/// Messages sent from worker processes to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Result of a stage execution
    Ack { ack: Ack },

    /// The worker's recorded timeline
    Timeline { timeline: Timeline },
}

impl WorkerReply {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerReply::Ack { .. } => "ack",
            WorkerReply::Timeline { .. } => "timeline",
        }
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecoach_core::{StageDescriptor, WorkerIdentity};
    use std::time::Duration;

    #[test]
    fn test_command_tagging() {
        let command = CoordinatorCommand::RunStage {
            stage_id: 4,
            data: AuxiliaryData::new(),
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "run_stage");
        assert_eq!(json["stage_id"], 4);
        assert!(command.expects_reply());

        let mut builder = StageProgram::builder();
        builder.stage(StageDescriptor::new("sleep"));
        let scenario = CoordinatorCommand::Scenario {
            program: builder.build().unwrap(),
        };
        assert!(!scenario.expects_reply());
        assert_eq!(scenario.kind(), "scenario");
    }

    #[test]
    fn test_message_envelope() {
        let reply = WorkerReply::Ack {
            ack: Ack::success(WorkerIdentity::first_generation(1), 0, Duration::from_millis(7), None),
        };
        let envelope = MessageEnvelope::new(reply);
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope<WorkerReply> = serde_json::from_str(&json).unwrap();
        match back.message {
            WorkerReply::Ack { ack } => assert_eq!(ack.worker_index(), 1),
            other => panic!("Expected ack, got {}", other.kind()),
        }
    }
}
