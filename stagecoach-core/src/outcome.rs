//! Stage outcomes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of running one stage, used by the scheduler to pick the next stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    /// Continue with the next stage
    Success,
    /// The benchmark failed; jump to teardown
    Fail,
    /// Like `Fail`, and skip all remaining configurations
    Exit,
    /// Leave the innermost loop
    Break,
    /// Jump back to the beginning of the innermost loop
    Continue,
}

impl StageOutcome {
    /// Check if the outcome marks the run as failed
    pub fn is_error(&self) -> bool {
        matches!(self, StageOutcome::Fail | StageOutcome::Exit)
    }

    /// Check if the outcome is resolved through the loop stack
    pub fn is_loop_control(&self) -> bool {
        matches!(self, StageOutcome::Break | StageOutcome::Continue)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Success => "SUCCESS",
            StageOutcome::Fail => "FAIL",
            StageOutcome::Exit => "EXIT",
            StageOutcome::Break => "BREAK",
            StageOutcome::Continue => "CONTINUE",
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
