//! Recovery sweeper
//!
//! Slower safety net behind the exit watcher and the completion monitor. It
//! repairs state that the fast paths missed: running agents whose process is
//! gone, folder queues with nothing running, agents nobody would hear about,
//! and terminal records that were never cleaned up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecutorError;
use crate::manager::{AgentManager, RunningProbe};
use crate::notify::{orphan_message, stuck_queue_message, NotificationSink};

/// Time given to an exit watcher that has reaped its process but not yet
/// recorded the exit
const EXIT_RECORD_GRACE: Duration = Duration::from_millis(500);

/// What one recovery cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub dead_detected: usize,
    pub queues_restarted: usize,
    pub orphans_reassigned: usize,
    pub stale_removed: usize,
    pub notification_failures: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoverySweeper {
    manager: AgentManager,
    sink: Arc<dyn NotificationSink>,
}

impl RecoverySweeper {
    pub fn new(manager: AgentManager, sink: Arc<dyn NotificationSink>) -> Self {
        Self { manager, sink }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.manager.config().recovery_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "Recovery sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Recovery sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.is_empty() {
                        debug!("Recovery sweep found nothing to repair");
                    } else {
                        info!(?report, "Recovery sweep repaired state");
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        self.fail_dead_agents(&mut report).await;
        self.restart_stuck_queues(&mut report).await;
        self.reassign_orphans(&mut report).await;
        self.remove_stale(&mut report).await;
        report
    }

    async fn fail_dead_agents(&self, report: &mut RecoveryReport) {
        let min_age = self.manager.config().stale_running;

        // Probed without the registry lock held
        let dead: Vec<RunningProbe> = self
            .manager
            .running_probes(min_age)
            .await
            .into_iter()
            .filter(|probe| !probe.process.as_ref().is_some_and(|p| p.is_alive()))
            .collect();
        if dead.is_empty() {
            return;
        }

        if dead.iter().any(|probe| probe.process.is_some()) {
            tokio::time::sleep(EXIT_RECORD_GRACE).await;
        }

        for probe in dead {
            let ran_for = (Utc::now() - probe.started_at).num_seconds().max(0);
            let detail = ExecutorError::ProcessDeathDetected {
                agent_id: probe.agent_id.clone(),
                detail: format!(
                    "process death detected by recovery, no exit observed \
                     (running for {}s, last status {})",
                    ran_for, probe.status
                ),
            }
            .to_string();

            if self.manager.force_fail(&probe.agent_id, detail).await {
                warn!(
                    agent_id = %probe.agent_id,
                    folder = %probe.folder,
                    ran_for,
                    "Running agent had no live process, marked failed"
                );
                self.manager.finalize(&probe.agent_id).await;
                report.dead_detected += 1;
            } else {
                debug!(agent_id = %probe.agent_id, "Exit recorded before recovery could act");
            }
        }
    }

    async fn restart_stuck_queues(&self, report: &mut RecoveryReport) {
        let admin = self.manager.config().admin_recipient.as_str();

        for stuck in self.manager.stuck_folders().await {
            warn!(
                folder = %stuck.folder,
                pending = stuck.pending,
                dangling_agent = ?stuck.dangling_agent,
                "Queue stalled with no running agent"
            );

            let recipient = stuck.head.requester.as_deref().unwrap_or(admin);
            let message = stuck_queue_message(&stuck.folder, &stuck.head, stuck.pending);
            if let Err(e) = self.sink.deliver(recipient, &message).await {
                warn!(recipient, "Stalled queue notification failed: {}", e);
                report.notification_failures += 1;
            }

            match self.manager.advance_queue(&stuck.folder).await {
                Ok(Some(agent_id)) => {
                    info!(folder = %stuck.folder, agent_id = %agent_id, "Restarted stalled queue");
                    report.queues_restarted += 1;
                }
                Ok(None) => debug!(folder = %stuck.folder, "Queue already moving"),
                Err(e) => warn!(folder = %stuck.folder, "Failed to restart queue: {}", e),
            }
        }
    }

    async fn reassign_orphans(&self, report: &mut RecoveryReport) {
        let admin = self.manager.config().admin_recipient.as_str();

        for agent in self.manager.orphaned_agents().await {
            if !self.manager.assign_requester(&agent.id, admin).await {
                continue;
            }
            info!(agent_id = %agent.id, recipient = %admin, "Assigned orphaned agent to admin");
            report.orphans_reassigned += 1;

            if let Err(e) = self.sink.deliver(admin, &orphan_message(&agent)).await {
                warn!(agent_id = %agent.id, "Orphan notification failed: {}", e);
                report.notification_failures += 1;
            }
        }
    }

    async fn remove_stale(&self, report: &mut RecoveryReport) {
        let min_age = self.manager.config().stale_cleanup;
        for agent_id in self.manager.stale_terminal(min_age).await {
            if self.manager.force_remove(&agent_id).await {
                info!(agent_id = %agent_id, "Removed stale terminal agent");
                report.stale_removed += 1;
            }
        }
    }
}
