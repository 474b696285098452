//! Agent manager - owns the agent registry, folder running slots and queue
//!
//! Every mutation of the shared state goes through one `RwLock<Registry>`.
//! Checking a folder's slot, popping its queue and assigning the slot always
//! happen inside a single write-lock critical section, which is what keeps a
//! folder at no more than one non-terminal agent.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use orch_core::{
    AgentSnapshot, AgentStatus, LaunchOutcome, LaunchRequest, QueueEntry, QueueEntryView,
    QueueStore,
};

use crate::config::OrchestratorConfig;
use crate::error::{ExecutorError, Result};
use crate::process::{AgentConfig, AgentProcess, OutputReaderHandle, ProcessExit, ProcessHandle};

/// Notification bookkeeping for one agent
#[derive(Debug, Default, Clone)]
struct NoticeState {
    notified: bool,
    delivery_failed: bool,
    attempts: u32,
    abandoned: bool,
}

/// Result of recording a notification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    /// Failed; will be retried on the next monitor cycle
    Retry,
    /// Failed too many times; no further attempts
    Abandoned,
}

struct AgentEntry {
    id: String,
    folder: String,
    prompt: String,
    requester: Option<String>,
    queue_id: Option<String>,
    status: AgentStatus,
    status_tx: watch::Sender<AgentStatus>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error: Option<String>,
    pid: Option<u32>,
    process: Option<ProcessHandle>,
    /// Launch order, used for stable listing
    launch_seq: u64,
    /// Slot released and queue advanced for this terminal transition
    finalized: bool,
    notice: NoticeState,
}

impl AgentEntry {
    fn new(
        launch_seq: u64,
        folder: String,
        prompt: String,
        requester: Option<String>,
        queue_id: Option<String>,
    ) -> Self {
        let (status_tx, _) = watch::channel(AgentStatus::Running);
        Self {
            id: Uuid::new_v4().to_string(),
            folder,
            prompt,
            requester,
            queue_id,
            status: AgentStatus::Running,
            status_tx,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            error: None,
            pid: None,
            process: None,
            launch_seq,
            finalized: false,
            notice: NoticeState::default(),
        }
    }

    /// Move to a terminal status, keeping `ended_at` in sync
    fn transition(&mut self, next: AgentStatus, error: Option<String>) -> orch_core::Result<()> {
        self.status = self.status.transition(next)?;
        self.ended_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
        self.status_tx.send_replace(next);
        Ok(())
    }

    fn is_reaped(&self) -> bool {
        self.process.as_ref().map_or(true, ProcessHandle::is_reaped)
    }

    /// Snapshot without output; output is read after the registry lock is
    /// released
    fn snapshot(&self) -> (AgentSnapshot, Option<ProcessHandle>) {
        let snapshot = AgentSnapshot {
            id: self.id.clone(),
            folder: self.folder.clone(),
            prompt: self.prompt.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            stdout: String::new(),
            stderr: String::new(),
            error: self.error.clone(),
            exit_code: self.exit_code,
            pid: self.pid,
            queue_id: self.queue_id.clone(),
            requester: self.requester.clone(),
        };
        (snapshot, self.process.clone())
    }
}

async fn with_output(
    (mut snapshot, process): (AgentSnapshot, Option<ProcessHandle>),
) -> AgentSnapshot {
    if let Some(process) = process {
        let (stdout, stderr) = process.output().await;
        snapshot.stdout = stdout;
        snapshot.stderr = stderr;
    }
    snapshot
}

#[derive(Default)]
struct Registry {
    agents: HashMap<String, AgentEntry>,
    /// folder -> agent currently holding the folder
    running: HashMap<String, String>,
    queue: QueueStore,
    next_launch_seq: u64,
}

impl Registry {
    /// Whether the folder's slot points at an existing, non-terminal agent
    fn slot_busy(&self, folder: &str) -> bool {
        self.running
            .get(folder)
            .and_then(|id| self.agents.get(id))
            .is_some_and(|entry| !entry.status.is_terminal())
    }
}

/// A running agent that may need a liveness probe
#[derive(Debug, Clone)]
pub struct RunningProbe {
    pub agent_id: String,
    pub folder: String,
    pub started_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub process: Option<ProcessHandle>,
}

/// A folder with pending entries and no live running agent
#[derive(Debug, Clone)]
pub struct StuckFolder {
    pub folder: String,
    pub head: QueueEntry,
    pub pending: usize,
    /// Agent ID the slot pointed at, if any
    pub dangling_agent: Option<String>,
}

/// Counters for health reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub agents: usize,
    pub running: usize,
    pub queued: usize,
    /// Terminal agents whose last notification attempt failed
    pub undelivered: usize,
    /// Terminal agents whose notification was given up
    pub abandoned: usize,
}

struct ManagerInner {
    config: OrchestratorConfig,
    registry: RwLock<Registry>,
}

/// Owns every known agent, the per-folder running slots and the queue.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Launch an agent, or queue it behind the folder's running agent.
    ///
    /// Fails only for an invalid folder. Spawn failures produce an agent in
    /// `failed` status instead of an error.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchOutcome> {
        let folder = resolve_folder(&request.folder).await?;
        let mut registry = self.inner.registry.write().await;

        // A free slot with pending entries means the queue is lagging; joining
        // its tail keeps FIFO order intact.
        if registry.slot_busy(&folder) || registry.queue.len(&folder) > 0 {
            let (entry, position) =
                registry
                    .queue
                    .enqueue(&folder, &request.prompt, request.requester.clone());
            info!(
                folder = %folder,
                queue_id = %entry.queue_id,
                position,
                "Folder busy, queued launch request"
            );
            self.advance_locked(&mut registry, &folder);

            // Promotion may have moved the new entry up or started it
            if let Some(position) = registry.queue.position(&folder, &entry.queue_id) {
                return Ok(LaunchOutcome::Queued {
                    queue_id: entry.queue_id,
                    position,
                });
            }
            let agent_id = registry
                .agents
                .values()
                .find(|agent| agent.queue_id.as_deref() == Some(entry.queue_id.as_str()))
                .map(|agent| agent.id.clone())
                .ok_or_else(|| {
                    ExecutorError::spawn_failed(format!(
                        "queue entry {} left the queue without an agent",
                        entry.queue_id
                    ))
                })?;
            return Ok(LaunchOutcome::Started { agent_id });
        }

        let agent_id = self.start_locked(
            &mut registry,
            folder,
            request.prompt,
            request.requester,
            None,
        );
        Ok(LaunchOutcome::Started { agent_id })
    }

    /// Snapshot of all known agents, in launch order
    pub async fn list(&self) -> Vec<AgentSnapshot> {
        let entries = {
            let registry = self.inner.registry.read().await;
            let mut entries: Vec<&AgentEntry> = registry.agents.values().collect();
            entries.sort_by_key(|entry| entry.launch_seq);
            entries.into_iter().map(AgentEntry::snapshot).collect::<Vec<_>>()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(with_output(entry).await);
        }
        snapshots
    }

    /// Snapshot of one agent
    pub async fn get(&self, agent_id: &str) -> Result<AgentSnapshot> {
        let entry = {
            let registry = self.inner.registry.read().await;
            registry
                .agents
                .get(agent_id)
                .map(AgentEntry::snapshot)
                .ok_or_else(|| not_found(agent_id))?
        };
        Ok(with_output(entry).await)
    }

    /// Kill a non-terminal agent and wait (bounded) for it to be recorded as
    /// `killed`.
    pub async fn kill(&self, agent_id: &str) -> Result<AgentSnapshot> {
        let (process, mut status_rx) = {
            let registry = self.inner.registry.read().await;
            let entry = registry
                .agents
                .get(agent_id)
                .ok_or_else(|| not_found(agent_id))?;
            if entry.status.is_terminal() {
                return Err(ExecutorError::AlreadyTerminal {
                    agent_id: agent_id.to_string(),
                    status: entry.status,
                });
            }
            (entry.process.clone(), entry.status_tx.subscribe())
        };

        info!(agent_id, "Killing agent");
        match process {
            Some(process) => process.request_kill(),
            None => {
                // Nothing to signal; record the kill directly
                self.record_status(agent_id, AgentStatus::Killed, None, None)
                    .await;
                self.finalize(agent_id).await;
            }
        }

        let timeout = self.inner.config.kill_timeout;
        let settled = matches!(
            tokio::time::timeout(timeout, status_rx.wait_for(|s| s.is_terminal())).await,
            Ok(Ok(_))
        );
        if !settled {
            warn!(agent_id, ?timeout, "Agent did not exit after kill request");
        }

        self.get(agent_id).await
    }

    /// Promote the folder's next queued entry if its slot is free.
    ///
    /// Idempotent: with the slot occupied, or the queue empty, this is a
    /// no-op. Returns the ID of the agent that was started, if any.
    pub async fn advance_queue(&self, folder: &str) -> Result<Option<String>> {
        let folder = folder_key(folder).await;
        let mut registry = self.inner.registry.write().await;
        Ok(self.advance_locked(&mut registry, &folder))
    }

    /// Mark-terminal-and-advance, shared by the exit watcher (push) and the
    /// completion monitor (poll).
    ///
    /// The first call for a terminal agent releases its folder slot and
    /// advances the queue; later calls return `false` and do nothing.
    pub async fn finalize(&self, agent_id: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        let folder = match registry.agents.get_mut(agent_id) {
            Some(entry) if entry.status.is_terminal() && !entry.finalized => {
                entry.finalized = true;
                entry.folder.clone()
            }
            _ => return false,
        };

        if registry.running.get(&folder).is_some_and(|id| id == agent_id) {
            registry.running.remove(&folder);
        }
        debug!(agent_id, folder = %folder, "Released folder slot");

        self.advance_locked(&mut registry, &folder);
        true
    }

    /// Pending count per folder
    pub async fn queue_status(&self) -> BTreeMap<String, usize> {
        self.inner.registry.read().await.queue.counts()
    }

    /// Pending entries per folder, in promotion order
    pub async fn queue_details(&self) -> BTreeMap<String, Vec<QueueEntryView>> {
        self.inner.registry.read().await.queue.details()
    }

    pub async fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.read().await;
        ManagerStats {
            agents: registry.agents.len(),
            running: registry
                .agents
                .values()
                .filter(|entry| entry.status.is_running())
                .count(),
            queued: registry.queue.total(),
            undelivered: registry
                .agents
                .values()
                .filter(|entry| entry.notice.delivery_failed && !entry.notice.notified)
                .count(),
            abandoned: registry
                .agents
                .values()
                .filter(|entry| entry.notice.abandoned)
                .count(),
        }
    }

    /// Remove every notified terminal agent immediately, bypassing the
    /// retention window. Agents still waiting for their notification are
    /// kept. Returns how many records were removed.
    pub async fn force_cleanup(&self) -> usize {
        let mut registry = self.inner.registry.write().await;
        let terminal: Vec<&AgentEntry> = registry
            .agents
            .values()
            .filter(|entry| entry.status.is_terminal())
            .collect();
        let pending = terminal.iter().filter(|entry| !entry.notice.notified).count();
        let settled: Vec<(String, String, bool)> = terminal
            .into_iter()
            .filter(|entry| entry.notice.notified)
            .map(|entry| (entry.id.clone(), entry.folder.clone(), entry.finalized))
            .collect();

        for (agent_id, folder, finalized) in &settled {
            registry.agents.remove(agent_id);
            if !finalized {
                self.advance_locked(&mut registry, folder);
            }
        }

        info!(
            removed = settled.len(),
            kept_unnotified = pending,
            "Force cleanup removed terminal agents"
        );
        settled.len()
    }

    /// Remove a terminal agent whose process has been fully reaped
    pub async fn remove(&self, agent_id: &str) -> Result<()> {
        let mut registry = self.inner.registry.write().await;
        let entry = registry
            .agents
            .get(agent_id)
            .ok_or_else(|| not_found(agent_id))?;

        if !entry.status.is_terminal() {
            return Err(ExecutorError::NotRemovable {
                agent_id: agent_id.to_string(),
                reason: format!("agent is {}", entry.status),
            });
        }
        if !entry.is_reaped() {
            return Err(ExecutorError::NotRemovable {
                agent_id: agent_id.to_string(),
                reason: "process output not reaped yet".to_string(),
            });
        }
        if !entry.finalized {
            return Err(ExecutorError::NotRemovable {
                agent_id: agent_id.to_string(),
                reason: "folder slot not released yet".to_string(),
            });
        }

        registry.agents.remove(agent_id);
        debug!(agent_id, "Removed agent record");
        Ok(())
    }

    /// Remove a notified terminal agent regardless of reaping state
    pub(crate) async fn force_remove(&self, agent_id: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(entry) = registry.agents.get(agent_id) else {
            return false;
        };
        if !entry.status.is_terminal() {
            return false;
        }
        if !entry.notice.notified {
            debug!(agent_id, "Stale agent not notified yet, keeping it");
            return false;
        }
        let folder = entry.folder.clone();
        let finalized = entry.finalized;
        registry.agents.remove(agent_id);
        if !finalized {
            self.advance_locked(&mut registry, &folder);
        }
        true
    }

    /// Terminal agents whose notification has not been settled yet
    pub(crate) async fn pending_notifications(&self) -> Vec<AgentSnapshot> {
        let entries: Vec<_> = {
            let registry = self.inner.registry.read().await;
            let mut entries: Vec<&AgentEntry> = registry
                .agents
                .values()
                .filter(|entry| entry.status.is_terminal() && !entry.notice.notified)
                .collect();
            entries.sort_by_key(|entry| entry.launch_seq);
            entries.into_iter().map(AgentEntry::snapshot).collect()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(with_output(entry).await);
        }
        snapshots
    }

    /// Record one notification attempt for an agent
    pub(crate) async fn record_delivery(
        &self,
        agent_id: &str,
        delivered: bool,
        max_attempts: u32,
    ) -> Option<DeliveryState> {
        let mut registry = self.inner.registry.write().await;
        let notice = &mut registry.agents.get_mut(agent_id)?.notice;
        notice.attempts += 1;

        if delivered {
            notice.notified = true;
            notice.delivery_failed = false;
            return Some(DeliveryState::Delivered);
        }

        notice.delivery_failed = true;
        if notice.attempts >= max_attempts {
            notice.notified = true;
            notice.abandoned = true;
            error!(
                agent_id,
                attempts = notice.attempts,
                "Giving up on completion notification"
            );
            Some(DeliveryState::Abandoned)
        } else {
            Some(DeliveryState::Retry)
        }
    }

    /// Notified terminal agents with their end time
    pub(crate) async fn settled_agents(&self) -> Vec<(String, DateTime<Utc>)> {
        let registry = self.inner.registry.read().await;
        registry
            .agents
            .values()
            .filter(|entry| entry.status.is_terminal() && entry.notice.notified)
            .filter_map(|entry| entry.ended_at.map(|ended| (entry.id.clone(), ended)))
            .collect()
    }

    /// Running agents started at least `min_age` ago
    pub(crate) async fn running_probes(&self, min_age: Duration) -> Vec<RunningProbe> {
        let registry = self.inner.registry.read().await;
        let now = Utc::now();
        registry
            .agents
            .values()
            .filter(|entry| entry.status.is_running())
            .filter(|entry| age(now, entry.started_at) >= min_age)
            .map(|entry| RunningProbe {
                agent_id: entry.id.clone(),
                folder: entry.folder.clone(),
                started_at: entry.started_at,
                status: entry.status,
                process: entry.process.clone(),
            })
            .collect()
    }

    /// Force a running agent to `failed`. Returns `false` if it was no
    /// longer running.
    pub(crate) async fn force_fail(&self, agent_id: &str, detail: String) -> bool {
        self.record_status(agent_id, AgentStatus::Failed, Some(detail), None)
            .await
    }

    /// Folders with pending entries whose slot is empty or stale
    pub(crate) async fn stuck_folders(&self) -> Vec<StuckFolder> {
        let registry = self.inner.registry.read().await;
        registry
            .queue
            .pending_folders()
            .into_iter()
            .filter(|folder| !registry.slot_busy(folder))
            .filter_map(|folder| {
                let head = registry.queue.peek(&folder)?.clone();
                Some(StuckFolder {
                    pending: registry.queue.len(&folder),
                    dangling_agent: registry.running.get(&folder).cloned(),
                    folder,
                    head,
                })
            })
            .collect()
    }

    /// Agents that have no requester to notify
    pub(crate) async fn orphaned_agents(&self) -> Vec<AgentSnapshot> {
        let registry = self.inner.registry.read().await;
        let mut orphans: Vec<&AgentEntry> = registry
            .agents
            .values()
            .filter(|entry| entry.requester.is_none())
            .collect();
        orphans.sort_by_key(|entry| entry.launch_seq);
        orphans.into_iter().map(|entry| entry.snapshot().0).collect()
    }

    /// Set the requester of an agent that has none. Returns `false` if the
    /// agent is gone or already has one.
    pub(crate) async fn assign_requester(&self, agent_id: &str, requester: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        match registry.agents.get_mut(agent_id) {
            Some(entry) if entry.requester.is_none() => {
                entry.requester = Some(requester.to_string());
                true
            }
            _ => false,
        }
    }

    /// Terminal agents that ended at least `min_age` ago
    pub(crate) async fn stale_terminal(&self, min_age: Duration) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        let now = Utc::now();
        registry
            .agents
            .values()
            .filter(|entry| entry.status.is_terminal())
            .filter(|entry| entry.ended_at.is_some_and(|ended| age(now, ended) >= min_age))
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Apply a terminal status. Illegal transitions are logged and ignored.
    async fn record_status(
        &self,
        agent_id: &str,
        next: AgentStatus,
        error: Option<String>,
        exit_code: Option<i32>,
    ) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(entry) = registry.agents.get_mut(agent_id) else {
            debug!(agent_id, %next, "Status update for unknown agent ignored");
            return false;
        };

        match entry.transition(next, error) {
            Ok(()) => {
                if exit_code.is_some() {
                    entry.exit_code = exit_code;
                }
                info!(
                    agent_id,
                    folder = %entry.folder,
                    status = %next,
                    "Agent reached terminal state"
                );
                true
            }
            Err(e) => {
                debug!(agent_id, "Ignoring status update: {}", e);
                false
            }
        }
    }

    async fn record_exit(&self, agent_id: &str, exit: ProcessExit) {
        let (status, detail) = if exit.killed {
            (AgentStatus::Killed, None)
        } else if let Some(err) = &exit.wait_error {
            (
                AgentStatus::Failed,
                Some(format!("failed to wait for process: {}", err)),
            )
        } else {
            match exit.code {
                Some(0) => (AgentStatus::Finished, None),
                Some(code) => (AgentStatus::Failed, Some(format!("exited with code {}", code))),
                None => (AgentStatus::Failed, Some("terminated by signal".to_string())),
            }
        };
        self.record_status(agent_id, status, detail, exit.code).await;
    }

    /// Create an agent and spawn its process. The caller holds the write
    /// lock and has checked that the folder slot is free.
    fn start_locked(
        &self,
        registry: &mut Registry,
        folder: String,
        prompt: String,
        requester: Option<String>,
        queue_id: Option<String>,
    ) -> String {
        let config = &self.inner.config;
        let launch_seq = registry.next_launch_seq;
        registry.next_launch_seq += 1;

        let mut entry = AgentEntry::new(launch_seq, folder, prompt, requester, queue_id);
        let agent_id = entry.id.clone();

        let spawned = AgentProcess::spawn(AgentConfig {
            command: config.agent_command.clone(),
            working_dir: PathBuf::from(&entry.folder),
            prompt: entry.prompt.clone(),
            env: config.env.clone(),
            max_output_bytes: config.max_output_bytes,
        })
        .and_then(AgentProcess::start_output_reader);

        match spawned {
            Ok((handle, reader)) => {
                entry.pid = handle.pid();
                entry.process = Some(handle);
                info!(
                    agent_id = %agent_id,
                    folder = %entry.folder,
                    pid = ?entry.pid,
                    queue_id = ?entry.queue_id,
                    "Agent started"
                );
                registry.running.insert(entry.folder.clone(), agent_id.clone());
                self.spawn_exit_watcher(agent_id.clone(), reader);
            }
            Err(e) => {
                warn!(agent_id = %agent_id, folder = %entry.folder, "Agent failed to start: {}", e);
                if let Err(e) = entry.transition(AgentStatus::Failed, Some(e.to_string())) {
                    error!(agent_id = %agent_id, "Invalid state after spawn failure: {}", e);
                }
                // Never held the slot
                entry.finalized = true;
            }
        }

        registry.agents.insert(agent_id.clone(), entry);
        agent_id
    }

    /// Promote queue entries until one starts or the queue is empty
    fn advance_locked(&self, registry: &mut Registry, folder: &str) -> Option<String> {
        loop {
            if registry.slot_busy(folder) {
                return None;
            }
            if let Some(stale) = registry.running.remove(folder) {
                debug!(folder, agent_id = %stale, "Cleared stale folder slot");
            }

            let entry = registry.queue.pop_front(folder)?;
            info!(folder, queue_id = %entry.queue_id, "Promoting queued request");
            let agent_id = self.start_locked(
                registry,
                entry.folder,
                entry.prompt,
                entry.requester,
                Some(entry.queue_id),
            );
            if registry.slot_busy(folder) {
                return Some(agent_id);
            }
        }
    }

    /// Exit watcher: records the exit, then runs the push-path completion
    /// callback.
    fn spawn_exit_watcher(&self, agent_id: String, reader: OutputReaderHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            let exit = reader.wait().await;
            debug!(agent_id = %agent_id, ?exit, "Agent process exited");
            manager.record_exit(&agent_id, exit).await;
            manager.finalize(&agent_id).await;
        });
    }

    #[cfg(test)]
    pub(crate) async fn insert_detached(
        &self,
        folder: &str,
        prompt: &str,
        requester: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> String {
        let mut registry = self.inner.registry.write().await;
        let launch_seq = registry.next_launch_seq;
        registry.next_launch_seq += 1;
        let mut entry = AgentEntry::new(
            launch_seq,
            folder.to_string(),
            prompt.to_string(),
            requester.map(String::from),
            None,
        );
        entry.started_at = started_at;
        let agent_id = entry.id.clone();
        registry.running.insert(folder.to_string(), agent_id.clone());
        registry.agents.insert(agent_id.clone(), entry);
        agent_id
    }

    /// Record a terminal status without running the completion callback
    #[cfg(test)]
    pub(crate) async fn mark_terminal(&self, agent_id: &str, status: AgentStatus) -> bool {
        self.record_status(agent_id, status, None, None).await
    }

    #[cfg(test)]
    pub(crate) async fn drop_record(&self, agent_id: &str) {
        self.inner.registry.write().await.agents.remove(agent_id);
    }

    #[cfg(test)]
    pub(crate) async fn backdate_end(&self, agent_id: &str, by: Duration) {
        let mut registry = self.inner.registry.write().await;
        if let Some(entry) = registry.agents.get_mut(agent_id) {
            if let Some(ended) = entry.ended_at {
                entry.ended_at = Some(ended - chrono::Duration::from_std(by).unwrap());
            }
        }
    }
}

fn not_found(agent_id: &str) -> ExecutorError {
    ExecutorError::AgentNotFound {
        agent_id: agent_id.to_string(),
    }
}

fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Canonical key for a folder; falls back to the raw string if the path no
/// longer resolves
async fn folder_key(folder: &str) -> String {
    tokio::fs::canonicalize(folder)
        .await
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| folder.to_string())
}

async fn resolve_folder(folder: &str) -> Result<String> {
    let invalid = || ExecutorError::InvalidFolder {
        path: PathBuf::from(folder),
    };

    if folder.trim().is_empty() {
        return Err(invalid());
    }
    let path = tokio::fs::canonicalize(folder.trim())
        .await
        .map_err(|_| invalid())?;
    let metadata = tokio::fs::metadata(&path).await.map_err(|_| invalid())?;
    if !metadata.is_dir() {
        return Err(invalid());
    }
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::AgentCommand;
    use tempfile::TempDir;

    fn test_manager() -> AgentManager {
        let config = OrchestratorConfig {
            kill_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }
        .with_agent_command(AgentCommand::shell());
        AgentManager::new(config)
    }

    fn folder(dir: &TempDir) -> String {
        dir.path().to_string_lossy().into_owned()
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn non_terminal_in(manager: &AgentManager, folder: &str) -> usize {
        manager
            .list()
            .await
            .iter()
            .filter(|a| a.folder == folder && !a.is_terminal())
            .count()
    }

    #[tokio::test]
    async fn test_launch_starts_then_queues() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();

        let first = manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        let second = manager
            .launch(LaunchRequest::new(folder(&dir), "echo second").with_requester("bob"))
            .await
            .unwrap();

        let agent_id = first.agent_id().unwrap().to_string();
        assert!(!first.is_queued());
        assert!(second.is_queued());
        assert!(second.id().starts_with("queued:1:"));

        let key = folder_key(&folder(&dir)).await;
        assert_eq!(manager.queue_status().await.get(&key), Some(&1));
        let details = manager.queue_details().await;
        assert_eq!(details[&key][0].prompt, "echo second");
        assert_eq!(details[&key][0].requester.as_deref(), Some("bob"));

        let agent = manager.get(&agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert!(agent.ended_at.is_none());
        assert!(agent.queue_id.is_none());

        manager.kill(&agent_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_folder() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        for bad in [
            String::new(),
            dir.path().join("missing").to_string_lossy().into_owned(),
            file.to_string_lossy().into_owned(),
        ] {
            let result = manager.launch(LaunchRequest::new(bad, "true")).await;
            assert!(matches!(result, Err(ExecutorError::InvalidFolder { .. })));
        }
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_failed_agent() {
        let config = OrchestratorConfig::default()
            .with_agent_command(AgentCommand::new("no-such-agent-binary-here", vec![]));
        let manager = AgentManager::new(config);
        let dir = TempDir::new().unwrap();

        let outcome = manager
            .launch(LaunchRequest::new(folder(&dir), "anything"))
            .await
            .unwrap();
        let agent = manager.get(outcome.agent_id().unwrap()).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Failed);
        assert!(agent.ended_at.is_some());
        assert!(agent.error.unwrap().contains("no-such-agent-binary-here"));

        // The slot was never held, so the next launch starts right away
        let next = manager
            .launch(LaunchRequest::new(folder(&dir), "anything"))
            .await
            .unwrap();
        assert!(!next.is_queued());
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_statuses() {
        let manager = test_manager();
        let ok_dir = TempDir::new().unwrap();
        let bad_dir = TempDir::new().unwrap();

        let ok = manager
            .launch(LaunchRequest::new(folder(&ok_dir), "echo done"))
            .await
            .unwrap();
        let bad = manager
            .launch(LaunchRequest::new(folder(&bad_dir), "echo oops >&2; exit 7"))
            .await
            .unwrap();
        let ok_id = ok.agent_id().unwrap().to_string();
        let bad_id = bad.agent_id().unwrap().to_string();

        wait_until(|| {
            let manager = manager.clone();
            let (ok_id, bad_id) = (ok_id.clone(), bad_id.clone());
            async move {
                manager.get(&ok_id).await.unwrap().is_terminal()
                    && manager.get(&bad_id).await.unwrap().is_terminal()
            }
        })
        .await;

        let ok = manager.get(&ok_id).await.unwrap();
        assert_eq!(ok.status, AgentStatus::Finished);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.stdout, "done\n");

        let bad = manager.get(&bad_id).await.unwrap();
        assert_eq!(bad.status, AgentStatus::Failed);
        assert_eq!(bad.exit_code, Some(7));
        assert_eq!(bad.error.as_deref(), Some("exited with code 7"));
        assert_eq!(bad.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_get_unknown_agent() {
        let manager = test_manager();
        let err = manager.get("nope").await.unwrap_err();
        assert!(matches!(err, ExecutorError::AgentNotFound { .. }));
        let err = manager.kill("nope").await.unwrap_err();
        assert!(matches!(err, ExecutorError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_kill_promotes_next_entry() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let key = folder_key(&folder(&dir)).await;

        let first = manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        let queued = manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        let first_id = first.agent_id().unwrap().to_string();

        let killed = manager.kill(&first_id).await.unwrap();
        assert_eq!(killed.status, AgentStatus::Killed);
        assert!(killed.ended_at.is_some());

        wait_until(|| {
            let manager = manager.clone();
            let key = key.clone();
            async move { non_terminal_in(&manager, &key).await == 1 }
        })
        .await;

        let promoted = manager
            .list()
            .await
            .into_iter()
            .find(|a| a.status == AgentStatus::Running)
            .unwrap();
        let queued_id = queued.id();
        let (_, queue_id) = LaunchOutcome::parse_queued_id(&queued_id).unwrap();
        assert_eq!(promoted.queue_id.as_deref(), Some(queue_id));
        assert!(manager.queue_status().await.is_empty());

        manager.kill(&promoted.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_terminal_agent_is_rejected_and_unchanged() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let outcome = manager
            .launch(LaunchRequest::new(folder(&dir), "echo hi"))
            .await
            .unwrap();
        let agent_id = outcome.agent_id().unwrap().to_string();

        wait_until(|| {
            let manager = manager.clone();
            let agent_id = agent_id.clone();
            async move { manager.get(&agent_id).await.unwrap().is_terminal() }
        })
        .await;

        let before = manager.get(&agent_id).await.unwrap();
        let err = manager.kill(&agent_id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::AlreadyTerminal {
                status: AgentStatus::Finished,
                ..
            }
        ));
        assert_eq!(manager.get(&agent_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_advance_queue_is_idempotent() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let key = folder_key(&folder(&dir)).await;

        manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();

        assert_eq!(manager.advance_queue(&key).await.unwrap(), None);
        assert_eq!(manager.advance_queue(&key).await.unwrap(), None);
        assert_eq!(manager.queue_status().await.get(&key), Some(&1));
        assert_eq!(non_terminal_in(&manager, &key).await, 1);

        // Empty queue on an idle folder is a no-op too
        let idle = TempDir::new().unwrap();
        assert_eq!(manager.advance_queue(&folder(&idle)).await.unwrap(), None);

        for agent in manager.list().await {
            let _ = manager.kill(&agent.id).await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_launch_and_advance_keep_one_runner() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let key = folder_key(&folder(&dir)).await;

        let mut tasks = Vec::new();
        for i in 0..12 {
            let manager = manager.clone();
            let folder = folder(&dir);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    manager.advance_queue(&key).await.unwrap();
                    None
                } else {
                    Some(
                        manager
                            .launch(LaunchRequest::new(folder, "sleep 30"))
                            .await
                            .unwrap(),
                    )
                }
            }));
        }

        let outcomes: Vec<LaunchOutcome> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();

        let started = outcomes.iter().filter(|o| !o.is_queued()).count();
        assert_eq!(started, 1);
        assert_eq!(non_terminal_in(&manager, &key).await, 1);
        assert_eq!(
            manager.queue_status().await.get(&key),
            Some(&(outcomes.len() - 1))
        );

        // Kill the runner repeatedly; each time exactly one successor runs
        for _ in 0..3 {
            let running = manager
                .list()
                .await
                .into_iter()
                .find(|a| a.status == AgentStatus::Running)
                .unwrap();
            let advances: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    let key = key.clone();
                    tokio::spawn(async move { manager.advance_queue(&key).await })
                })
                .collect();
            manager.kill(&running.id).await.unwrap();
            futures::future::join_all(advances).await;

            wait_until(|| {
                let manager = manager.clone();
                let key = key.clone();
                async move { non_terminal_in(&manager, &key).await == 1 }
            })
            .await;
            assert!(non_terminal_in(&manager, &key).await <= 1);
        }

        for agent in manager.list().await {
            let _ = manager.kill(&agent.id).await;
        }
    }

    #[tokio::test]
    async fn test_queue_promotes_in_fifo_order() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();

        manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 0.3"))
            .await
            .unwrap();
        let mut queue_ids = Vec::new();
        for i in 0..5 {
            let outcome = manager
                .launch(LaunchRequest::new(folder(&dir), format!("echo {}", i)))
                .await
                .unwrap();
            let (position, queue_id) = LaunchOutcome::parse_queued_id(&outcome.id())
                .map(|(p, q)| (p, q.to_string()))
                .unwrap();
            assert_eq!(position, i + 1);
            queue_ids.push(queue_id);
        }

        wait_until(|| {
            let manager = manager.clone();
            async move {
                let agents = manager.list().await;
                agents.len() == 6 && agents.iter().all(|a| a.is_terminal())
            }
        })
        .await;

        let promoted: Vec<String> = manager
            .list()
            .await
            .into_iter()
            .filter_map(|a| a.queue_id)
            .collect();
        assert_eq!(promoted, queue_ids);

        let outputs: Vec<String> = manager
            .list()
            .await
            .into_iter()
            .skip(1)
            .map(|a| a.stdout)
            .collect();
        assert_eq!(outputs, vec!["0\n", "1\n", "2\n", "3\n", "4\n"]);
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_and_finalized() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let outcome = manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        let agent_id = outcome.agent_id().unwrap().to_string();

        let err = manager.remove(&agent_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotRemovable { .. }));

        manager.kill(&agent_id).await.unwrap();
        wait_until(|| {
            let manager = manager.clone();
            let agent_id = agent_id.clone();
            async move { manager.remove(&agent_id).await.is_ok() }
        })
        .await;
        assert!(manager.get(&agent_id).await.is_err());
    }

    #[tokio::test]
    async fn test_force_cleanup_removes_only_notified_terminal_agents() {
        let manager = test_manager();
        let busy = TempDir::new().unwrap();
        let done = TempDir::new().unwrap();
        let silent = TempDir::new().unwrap();

        let running = manager
            .launch(LaunchRequest::new(folder(&busy), "sleep 30"))
            .await
            .unwrap();
        let finished = manager
            .launch(LaunchRequest::new(folder(&done), "true").with_requester("alice"))
            .await
            .unwrap();
        let unnotified = manager
            .launch(LaunchRequest::new(folder(&silent), "true").with_requester("bob"))
            .await
            .unwrap();
        let finished_id = finished.agent_id().unwrap().to_string();
        let unnotified_id = unnotified.agent_id().unwrap().to_string();

        wait_until(|| {
            let manager = manager.clone();
            let (finished_id, unnotified_id) = (finished_id.clone(), unnotified_id.clone());
            async move {
                manager.get(&finished_id).await.unwrap().is_terminal()
                    && manager.get(&unnotified_id).await.unwrap().is_terminal()
            }
        })
        .await;

        assert_eq!(
            manager.record_delivery(&finished_id, true, 3).await,
            Some(DeliveryState::Delivered)
        );

        assert_eq!(manager.force_cleanup().await, 1);
        assert!(manager.get(&finished_id).await.is_err());
        assert!(manager.get(&unnotified_id).await.is_ok());
        let running_id = running.agent_id().unwrap();
        assert!(manager.get(running_id).await.is_ok());
        assert_eq!(manager.stats().await.running, 1);

        // A stale-cleanup removal needs the notification too
        assert!(!manager.force_remove(&unnotified_id).await);
        manager.record_delivery(&unnotified_id, true, 3).await;
        assert!(manager.force_remove(&unnotified_id).await);

        manager.kill(running_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_queue_launch_reports_position_after_promotion() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let key = folder_key(&folder(&dir)).await;

        let holder = manager
            .insert_detached(&key, "holder", Some("alice"), Utc::now())
            .await;
        manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();

        // Lose the runner; the slot is free but the queue still waits
        manager.drop_record(&holder).await;

        let third = manager
            .launch(LaunchRequest::new(folder(&dir), "true"))
            .await
            .unwrap();
        assert!(third.is_queued());
        assert!(third.id().starts_with("queued:1:"));

        let details = manager.queue_details().await;
        assert_eq!(details[&key].len(), 1);
        let third_id = third.id();
        let (position, queue_id) = LaunchOutcome::parse_queued_id(&third_id).unwrap();
        assert_eq!(details[&key][0].queue_id, queue_id);
        assert_eq!(details[&key][0].position, position);
        assert_eq!(non_terminal_in(&manager, &key).await, 1);

        for agent in manager.list().await {
            let _ = manager.kill(&agent.id).await;
        }
    }

    #[tokio::test]
    async fn test_lagging_queue_launch_started_when_promoted() {
        let config = OrchestratorConfig::default()
            .with_agent_command(AgentCommand::new("no-such-agent-binary-here", vec![]));
        let manager = AgentManager::new(config);
        let dir = TempDir::new().unwrap();
        let key = folder_key(&folder(&dir)).await;

        // A queued entry behind a detached holder that is then lost
        let holder = manager
            .insert_detached(&key, "holder", Some("alice"), Utc::now())
            .await;
        let queued = manager
            .launch(LaunchRequest::new(folder(&dir), "first"))
            .await
            .unwrap();
        assert!(queued.is_queued());
        manager.drop_record(&holder).await;

        // Each promotion fails to spawn, so the loop drains up to and
        // including the new entry
        let outcome = manager
            .launch(LaunchRequest::new(folder(&dir), "second"))
            .await
            .unwrap();
        assert!(!outcome.is_queued());
        let agent = manager.get(outcome.agent_id().unwrap()).await.unwrap();
        assert_eq!(agent.prompt, "second");
        assert_eq!(agent.status, AgentStatus::Failed);
        assert!(agent.queue_id.is_some());
        assert!(manager.queue_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_runs_once() {
        let manager = test_manager();
        let dir = TempDir::new().unwrap();
        let outcome = manager
            .launch(LaunchRequest::new(folder(&dir), "sleep 30"))
            .await
            .unwrap();
        let agent_id = outcome.agent_id().unwrap().to_string();

        // Not terminal yet
        assert!(!manager.finalize(&agent_id).await);

        manager.kill(&agent_id).await.unwrap();
        // Whichever of the exit watcher and this call came first did the work
        manager.finalize(&agent_id).await;
        assert!(!manager.finalize(&agent_id).await);
        assert!(manager.remove(&agent_id).await.is_ok());
    }
}
