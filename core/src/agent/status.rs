//! Agent lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Status of an agent process.
///
/// A queued request is not an agent yet; it lives in the queue store until
/// it is promoted, at which point it starts out as `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The process has been spawned and no exit was recorded yet
    Running,
    /// The process exited successfully
    Finished,
    /// The process exited with a failure, could not be spawned, or was
    /// found dead by the recovery sweep
    Failed,
    /// The process was terminated on request
    Killed,
}

impl AgentStatus {
    /// Check if the status is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }

    /// Check if the status is running
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        match (self, next) {
            (Self::Running, Self::Finished | Self::Failed | Self::Killed) => true,
            (Self::Running, Self::Running) => false,
            (Self::Finished | Self::Failed | Self::Killed, _) => false,
        }
    }

    /// Validate a transition and return the new status
    pub fn transition(self, next: AgentStatus) -> Result<AgentStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Get the canonical string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
