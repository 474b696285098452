//! Error types for the core library

use thiserror::Error;

use crate::agent::AgentStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: AgentStatus, to: AgentStatus },
}
