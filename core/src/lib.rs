//! Core library for the folder-serialized agent orchestrator
//!
//! This crate contains the data model shared by the runner and the server:
//! - Agent status state machine and snapshots
//! - Per-folder FIFO queue store
//! - Launch request/outcome types

pub mod agent;
pub mod error;
pub mod queue;

pub use agent::{AgentSnapshot, AgentStatus, LaunchOutcome, LaunchRequest};
pub use error::Error;
pub use queue::{QueueEntry, QueueEntryView, QueueStore};

pub type Result<T> = std::result::Result<T, Error>;
