//! Queue entry definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A launch request waiting for its folder's running slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: String,
    pub folder: String,
    pub prompt: String,
    pub requester: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Store-wide enqueue counter; strictly increasing, orders folders by
    /// how long their head entry has waited
    pub seq: u64,
}

/// Public view of a pending entry, as reported by queue status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryView {
    pub queue_id: String,
    pub prompt: String,
    pub requester: Option<String>,
    /// 1-based position in the folder's queue
    pub position: usize,
    pub enqueued_at: DateTime<Utc>,
}
