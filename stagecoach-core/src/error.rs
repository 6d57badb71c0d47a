//! Core error types for Stagecoach

use thiserror::Error;

/// Core error type for program construction and stage instantiation
#[derive(Debug, Error)]
pub enum CoreError {
    /// No factory is registered under the requested stage name
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// A stage factory rejected the descriptor it was given
    #[error("Invalid stage '{stage}': {message}")]
    InvalidStage { stage: String, message: String },

    /// A stage property could not be interpreted
    #[error("Invalid property '{property}' on stage '{stage}': {message}")]
    InvalidProperty {
        stage: String,
        property: String,
        message: String,
    },

    /// The program violates a structural rule
    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    /// Stage index outside the program
    #[error("Stage index {index} out of range (program has {len} stages)")]
    StageOutOfRange { index: usize, len: usize },

    /// A named value in the state has an unexpected shape
    #[error("State value '{key}' has unexpected type: {message}")]
    StateType { key: String, message: String },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error raised by a stage implementation while it runs
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The stage reported a failure
    #[error("{0}")]
    Failed(String),

    /// The stage panicked
    #[error("Stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Create a failure from any message
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed(message.into())
    }
}

impl From<CoreError> for StageError {
    fn from(err: CoreError) -> Self {
        StageError::Failed(err.to_string())
    }
}
