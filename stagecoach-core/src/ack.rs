//! Per-worker stage acknowledgements

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::identity::WorkerIdentity;

/// A worker's reported result for one stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub worker: WorkerIdentity,
    pub stage_id: usize,
    pub error: bool,
    pub error_message: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Stage-specific result handed to the coordinator-side reduction
    pub payload: Option<JsonValue>,
}

impl Ack {
    /// Create a successful acknowledgement
    pub fn success(
        worker: WorkerIdentity,
        stage_id: usize,
        duration: Duration,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            worker,
            stage_id,
            error: false,
            error_message: None,
            duration,
            payload,
        }
    }

    /// Create an error acknowledgement
    pub fn failure(
        worker: WorkerIdentity,
        stage_id: usize,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            worker,
            stage_id,
            error: true,
            error_message: Some(message.into()),
            duration,
            payload: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Logical worker index the ack came from
    pub fn worker_index(&self) -> usize {
        self.worker.index
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
