//! Test helpers shared by the monitor and recovery tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OrchestratorConfig;
use crate::error::{ExecutorError, Result};
use crate::manager::AgentManager;
use crate::notify::NotificationSink;
use crate::process::AgentCommand;

/// Sink that records every delivery and can be switched to fail
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.deliveries().into_iter().map(|(r, _)| r).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, recipient: &str, message: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExecutorError::delivery_failed(recipient, "sink offline"));
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((recipient.to_string(), message.to_string()));
        Ok(())
    }
}

/// Manager running `sh -c <prompt>` agents with zeroed windows
pub fn shell_manager() -> AgentManager {
    let config = OrchestratorConfig {
        retention: Duration::ZERO,
        removal_give_up: Duration::from_secs(60),
        stale_running: Duration::ZERO,
        stale_cleanup: Duration::from_secs(60),
        kill_timeout: Duration::from_secs(5),
        max_delivery_attempts: 3,
        ..OrchestratorConfig::default()
    }
    .with_agent_command(AgentCommand::shell());
    AgentManager::new(config)
}

/// Canonical form of a temp folder, as the manager keys it
pub fn canonical(dir: &tempfile::TempDir) -> String {
    std::fs::canonicalize(dir.path())
        .unwrap()
        .to_string_lossy()
        .into_owned()
}
