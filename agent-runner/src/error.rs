//! Error types for agent-runner

use std::path::PathBuf;
use thiserror::Error;

use orch_core::AgentStatus;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while orchestrating agents
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Unknown agent ID
    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    /// Kill requested on an agent that already reached a terminal state
    #[error("Agent {agent_id} is already {status}")]
    AlreadyTerminal {
        agent_id: String,
        status: AgentStatus,
    },

    /// Target folder does not exist or is not a directory
    #[error("Invalid folder: {path}")]
    InvalidFolder { path: PathBuf },

    /// Failed to spawn agent process
    #[error("Failed to spawn agent process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A running agent's process was found dead without an observed exit
    #[error("Process death detected for agent {agent_id}: {detail}")]
    ProcessDeathDetected { agent_id: String, detail: String },

    /// A notification could not be delivered
    #[error("Failed to deliver notification to {recipient}: {message}")]
    DeliveryFailed { recipient: String, message: String },

    /// Agent record cannot be removed yet
    #[error("Agent {agent_id} cannot be removed: {reason}")]
    NotRemovable { agent_id: String, reason: String },

    /// Invalid agent type
    #[error("Invalid agent type: {agent_type}")]
    InvalidAgentType { agent_type: String },
}

impl ExecutorError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a DeliveryFailed error
    pub fn delivery_failed(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            recipient: recipient.into(),
            message: message.into(),
        }
    }
}
