//! Agent model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::AgentStatus;

/// Prefix that marks a launch outcome ID as a queue placeholder
pub const QUEUED_ID_PREFIX: &str = "queued:";

/// A request to run an agent against a folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub folder: String,
    pub prompt: String,
    /// Identity that should receive the completion notification
    pub requester: Option<String>,
}

impl LaunchRequest {
    /// Create a launch request without a requester
    pub fn new(folder: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            prompt: prompt.into(),
            requester: None,
        }
    }

    /// Set the requester identity
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
}

/// Result of a launch: either started right away or queued behind the
/// folder's running agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Started { agent_id: String },
    Queued { queue_id: String, position: usize },
}

impl LaunchOutcome {
    /// Render the outcome as a single ID string.
    ///
    /// Started agents use their bare ID; queued entries use
    /// `queued:<position>:<queue_id>`.
    pub fn id(&self) -> String {
        match self {
            Self::Started { agent_id } => agent_id.clone(),
            Self::Queued { queue_id, position } => {
                format!("{}{}:{}", QUEUED_ID_PREFIX, position, queue_id)
            }
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// Agent ID if the launch started immediately
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Started { agent_id } => Some(agent_id),
            Self::Queued { .. } => None,
        }
    }

    /// Parse a queued placeholder back into `(position, queue_id)`
    pub fn parse_queued_id(id: &str) -> Option<(usize, &str)> {
        let rest = id.strip_prefix(QUEUED_ID_PREFIX)?;
        let (position, queue_id) = rest.split_once(':')?;
        let position = position.parse().ok()?;
        if queue_id.is_empty() {
            return None;
        }
        Some((position, queue_id))
    }
}

/// Point-in-time copy of an agent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    pub folder: String,
    pub prompt: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Queue entry this agent was promoted from, if any
    pub queue_id: Option<String>,
    pub requester: Option<String>,
}

impl AgentSnapshot {
    /// Wall-clock run time, up to now for running agents
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
