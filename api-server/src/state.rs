//! Application state

use std::sync::Arc;

use agent_runner::{AgentManager, OrchestratorConfig};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: AgentManager,
    notification_target: String,
}

impl AppState {
    pub fn new(manager: AgentManager, notification_target: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                manager,
                notification_target: notification_target.into(),
            }),
        }
    }

    /// Get reference to the agent manager
    pub fn manager(&self) -> &AgentManager {
        &self.inner.manager
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.inner.manager.config()
    }

    /// Where notifications go: `log` or the webhook URL
    pub fn notification_target(&self) -> &str {
        &self.inner.notification_target
    }
}
