//! Agent Runner - folder-serialized agent orchestration
//!
//! Spawns coding agents (OpenCode, Claude Code, etc.) as subprocesses, keeps
//! at most one running per folder with a FIFO queue behind it, and watches
//! them with a completion monitor and a recovery sweeper.

mod config;
mod error;
mod manager;
mod monitor;
mod notify;
mod process;
mod recovery;

#[cfg(test)]
mod testing;

pub use config::OrchestratorConfig;
pub use error::{ExecutorError, Result};
pub use manager::{AgentManager, DeliveryState, ManagerStats};
pub use monitor::{CompletionMonitor, MonitorReport};
pub use notify::{completion_message, LogSink, NotificationSink, WebhookSink};
pub use process::{AgentCommand, AgentProcess, AgentType, ProcessExit, ProcessHandle};
pub use recovery::{RecoveryReport, RecoverySweeper};
