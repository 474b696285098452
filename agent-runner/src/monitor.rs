//! Completion monitor
//!
//! Polls the manager on a short interval: notifies requesters of terminal
//! agents, runs the shared finalize path, and removes settled agents once
//! their retention window has passed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::{AgentManager, DeliveryState};
use crate::notify::{completion_message, NotificationSink};

/// What one monitor cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub notified: usize,
    pub delivery_failures: usize,
    pub abandoned: usize,
    pub finalized: usize,
    pub removed: usize,
    pub removal_retries: usize,
    pub removal_dropped: usize,
}

impl MonitorReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct CompletionMonitor {
    manager: AgentManager,
    sink: Arc<dyn NotificationSink>,
    /// agent id -> first failed removal attempt
    removal_failures: HashMap<String, Instant>,
    /// Agents whose removal was given up; left to the recovery sweeper
    abandoned_removals: HashSet<String>,
}

impl CompletionMonitor {
    pub fn new(manager: AgentManager, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            manager,
            sink,
            removal_failures: HashMap::new(),
            abandoned_removals: HashSet::new(),
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let period = self.manager.config().monitor_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "Completion monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Completion monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if !report.is_empty() {
                        debug!(?report, "Completion monitor cycle");
                    }
                }
            }
        }
    }

    /// One detection/notification/removal pass
    pub async fn run_cycle(&mut self) -> MonitorReport {
        let mut report = MonitorReport::default();
        self.notify_terminal(&mut report).await;
        self.remove_settled(&mut report).await;
        report
    }

    async fn notify_terminal(&mut self, report: &mut MonitorReport) {
        let max_attempts = self.manager.config().max_delivery_attempts;

        for agent in self.manager.pending_notifications().await {
            // Poll path of completion: a no-op if the exit watcher got there first
            if self.manager.finalize(&agent.id).await {
                report.finalized += 1;
            }

            let Some(recipient) = agent.requester.as_deref() else {
                // Left for the recovery sweeper's orphan step
                continue;
            };

            let delivered = match self
                .sink
                .deliver(recipient, &completion_message(&agent))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(agent_id = %agent.id, recipient, "Completion notification failed: {}", e);
                    false
                }
            };

            match self
                .manager
                .record_delivery(&agent.id, delivered, max_attempts)
                .await
            {
                Some(DeliveryState::Delivered) => {
                    info!(agent_id = %agent.id, recipient, status = %agent.status, "Requester notified");
                    report.notified += 1;
                }
                Some(DeliveryState::Retry) => report.delivery_failures += 1,
                Some(DeliveryState::Abandoned) => {
                    report.delivery_failures += 1;
                    report.abandoned += 1;
                }
                None => debug!(agent_id = %agent.id, "Agent removed during notification"),
            }
        }
    }

    async fn remove_settled(&mut self, report: &mut MonitorReport) {
        let config = self.manager.config();
        let retention = config.retention;
        let give_up = config.removal_give_up;
        let now = Utc::now();

        let settled = self.manager.settled_agents().await;
        let known: HashSet<&str> = settled.iter().map(|(id, _)| id.as_str()).collect();
        self.removal_failures.retain(|id, _| known.contains(id.as_str()));
        self.abandoned_removals.retain(|id| known.contains(id.as_str()));

        for (agent_id, ended_at) in &settled {
            if self.abandoned_removals.contains(agent_id) {
                continue;
            }
            let age = (now - *ended_at).to_std().unwrap_or(Duration::ZERO);
            if age < retention {
                continue;
            }

            match self.manager.remove(agent_id).await {
                Ok(()) => {
                    self.removal_failures.remove(agent_id);
                    report.removed += 1;
                }
                Err(e) => {
                    let first = *self
                        .removal_failures
                        .entry(agent_id.clone())
                        .or_insert_with(Instant::now);
                    if first.elapsed() >= give_up {
                        error!(
                            agent_id = %agent_id,
                            waited = ?first.elapsed(),
                            "Agent record still unremovable, dropping it from monitor tracking: {}",
                            e
                        );
                        self.removal_failures.remove(agent_id);
                        self.abandoned_removals.insert(agent_id.clone());
                        report.removal_dropped += 1;
                    } else {
                        debug!(agent_id = %agent_id, "Removal deferred: {}", e);
                        report.removal_retries += 1;
                    }
                }
            }
        }
    }
}
