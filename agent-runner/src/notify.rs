//! Completion notification sinks
//!
//! The orchestrator only knows that a message must be handed to a recipient;
//! how it reaches a person is up to the sink.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use orch_core::{AgentSnapshot, AgentStatus, QueueEntry};

use crate::error::{ExecutorError, Result};

/// How much captured output a completion message carries
const OUTPUT_TAIL_CHARS: usize = 1500;

/// Destination for orchestrator notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one message to one recipient
    async fn deliver(&self, recipient: &str, message: &str) -> Result<()>;
}

/// Sink that only writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, recipient: &str, message: &str) -> Result<()> {
        info!(recipient, "Notification:\n{}", message);
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    recipient: &'a str,
    message: &'a str,
}

/// Sink that POSTs `{recipient, message}` as JSON to a webhook
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, recipient: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { recipient, message })
            .send()
            .await
            .map_err(|e| ExecutorError::delivery_failed(recipient, e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::delivery_failed(
                recipient,
                format!("webhook returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(idx, _)| idx);
    &text[start..]
}

/// Message sent once an agent reaches a terminal state
pub fn completion_message(agent: &AgentSnapshot) -> String {
    let headline = match agent.status {
        AgentStatus::Finished => "finished",
        AgentStatus::Failed => "failed",
        AgentStatus::Killed => "was killed",
        AgentStatus::Running => "is still running",
    };

    let mut msg = format!(
        "Agent {} {} in {} after {:.1}s\nTask: {}\n",
        agent.id,
        headline,
        agent.folder,
        agent.duration_ms() as f64 / 1000.0,
        agent.prompt
    );
    if let Some(queue_id) = &agent.queue_id {
        msg.push_str(&format!("Queue entry: {}\n", queue_id));
    }
    if let Some(code) = agent.exit_code {
        msg.push_str(&format!("Exit code: {}\n", code));
    }
    if let Some(error) = &agent.error {
        msg.push_str(&format!("Error: {}\n", error));
    }

    let stdout = agent.stdout.trim_end();
    if !stdout.is_empty() {
        msg.push_str(&format!("Output:\n{}\n", tail(stdout, OUTPUT_TAIL_CHARS)));
    }
    let stderr = agent.stderr.trim_end();
    if !stderr.is_empty() {
        msg.push_str(&format!("Errors:\n{}\n", tail(stderr, OUTPUT_TAIL_CHARS)));
    }
    msg
}

/// Message sent when recovery restarts a stalled folder queue
pub fn stuck_queue_message(folder: &str, head: &QueueEntry, pending: usize) -> String {
    format!(
        "Queue for {} was stalled with {} pending task(s) and no running agent; \
         restarting it with your task: {}",
        folder, pending, head.prompt
    )
}

/// Message sent to the admin recipient when an agent had no requester
pub fn orphan_message(agent: &AgentSnapshot) -> String {
    format!(
        "Agent {} in {} ({}) had no requester; its notifications are now routed to you. Task: {}",
        agent.id, agent.folder, agent.status, agent.prompt
    )
}
