//! Orchestrator policy knobs
//!
//! The intervals and windows here are heuristics, not invariants. Each has a
//! named default and an environment override so deployments can tune them.

use std::time::Duration;

use tracing::warn;

use crate::process::{AgentCommand, AgentType};

/// Poll interval of the completion monitor
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(3);
/// Interval of the recovery sweep
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);
/// How long a notified terminal agent stays queryable before removal
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);
/// How long the monitor keeps retrying a failed removal before dropping it
pub const DEFAULT_REMOVAL_GIVE_UP: Duration = Duration::from_secs(10 * 60);
/// Minimum run time before a running agent is probed for liveness
pub const DEFAULT_STALE_RUNNING: Duration = Duration::from_secs(60);
/// Age after which the sweeper force-removes terminal agents
pub const DEFAULT_STALE_CLEANUP: Duration = Duration::from_secs(30 * 60);
/// How long a kill waits for the process to exit
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024;
pub const DEFAULT_ADMIN_RECIPIENT: &str = "admin";

/// Configuration shared by the manager, monitor and recovery sweeper
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub monitor_interval: Duration,
    pub recovery_interval: Duration,
    pub retention: Duration,
    pub removal_give_up: Duration,
    pub stale_running: Duration,
    pub stale_cleanup: Duration,
    pub kill_timeout: Duration,
    pub max_delivery_attempts: u32,
    pub max_output_bytes: usize,
    /// Recipient for agents that have no requester
    pub admin_recipient: String,
    /// Command used to start agents
    pub agent_command: AgentCommand,
    /// Extra environment variables for every agent
    pub env: Vec<(String, String)>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            retention: DEFAULT_RETENTION,
            removal_give_up: DEFAULT_REMOVAL_GIVE_UP,
            stale_running: DEFAULT_STALE_RUNNING,
            stale_cleanup: DEFAULT_STALE_CLEANUP,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            admin_recipient: DEFAULT_ADMIN_RECIPIENT.to_string(),
            agent_command: AgentCommand::default(),
            env: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from defaults plus `ORCH_*` environment overrides
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let secs = |key: &str, default: Duration| -> Duration {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(v) => Duration::from_secs(v),
                    Err(_) => {
                        warn!("Ignoring invalid {}={:?}", key, raw);
                        default
                    }
                },
                None => default,
            }
        };

        config.monitor_interval = secs("ORCH_MONITOR_INTERVAL_SECS", config.monitor_interval);
        config.recovery_interval = secs("ORCH_RECOVERY_INTERVAL_SECS", config.recovery_interval);
        config.retention = secs("ORCH_RETENTION_SECS", config.retention);
        config.removal_give_up = secs("ORCH_REMOVAL_GIVE_UP_SECS", config.removal_give_up);
        config.stale_running = secs("ORCH_STALE_RUNNING_SECS", config.stale_running);
        config.stale_cleanup = secs("ORCH_STALE_CLEANUP_SECS", config.stale_cleanup);
        config.kill_timeout = secs("ORCH_KILL_TIMEOUT_SECS", config.kill_timeout);

        if let Some(raw) = lookup("ORCH_MAX_DELIVERY_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(v) if v > 0 => config.max_delivery_attempts = v,
                _ => warn!("Ignoring invalid ORCH_MAX_DELIVERY_ATTEMPTS={:?}", raw),
            }
        }

        if let Some(admin) = lookup("ORCH_ADMIN_RECIPIENT").filter(|s| !s.trim().is_empty()) {
            config.admin_recipient = admin.trim().to_string();
        }

        if let Some(raw) = lookup("ORCH_AGENT_TYPE") {
            match raw.parse::<AgentType>() {
                Ok(agent_type) => config.agent_command = AgentCommand::for_agent(agent_type),
                Err(e) => warn!("{}, keeping {}", e, config.agent_command.program),
            }
        }

        // An explicit program wins over the agent type preset
        if let Some(program) = lookup("ORCH_AGENT_PROGRAM").filter(|s| !s.trim().is_empty()) {
            let mut parts = program.split_whitespace().map(String::from);
            if let Some(bin) = parts.next() {
                config.agent_command = AgentCommand::new(bin, parts.collect());
            }
        }

        config
    }

    /// Builder-style override of the agent command
    pub fn with_agent_command(mut self, command: AgentCommand) -> Self {
        self.agent_command = command;
        self
    }
}
