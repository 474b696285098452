//! In-memory per-folder queue store
//!
//! The store has no internal locking. Its owner keeps it behind the same lock
//! that protects the folder running slots, so that "slot is free" and "pop the
//! next entry" happen in one critical section.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use super::model::{QueueEntry, QueueEntryView};

/// Per-folder FIFO of pending launch requests
#[derive(Debug, Default)]
pub struct QueueStore {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    next_seq: u64,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request to the folder's queue.
    ///
    /// Returns the new entry and its 1-based position.
    pub fn enqueue(
        &mut self,
        folder: &str,
        prompt: &str,
        requester: Option<String>,
    ) -> (QueueEntry, usize) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = QueueEntry {
            queue_id: Uuid::new_v4().to_string(),
            folder: folder.to_string(),
            prompt: prompt.to_string(),
            requester,
            enqueued_at: Utc::now(),
            seq,
        };

        let queue = self.queues.entry(folder.to_string()).or_default();
        queue.push_back(entry.clone());
        (entry, queue.len())
    }

    /// Remove and return the earliest entry for a folder
    pub fn pop_front(&mut self, folder: &str) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(folder)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(folder);
        }
        entry
    }

    /// Earliest entry for a folder without removing it
    pub fn peek(&self, folder: &str) -> Option<&QueueEntry> {
        self.queues.get(folder).and_then(|q| q.front())
    }

    /// Number of pending entries for a folder
    pub fn len(&self, folder: &str) -> usize {
        self.queues.get(folder).map_or(0, VecDeque::len)
    }

    /// Total number of pending entries across all folders
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Folders that currently have pending entries, longest-waiting head
    /// first
    pub fn pending_folders(&self) -> Vec<String> {
        let mut heads: Vec<(u64, &String)> = self
            .queues
            .iter()
            .filter_map(|(folder, queue)| queue.front().map(|head| (head.seq, folder)))
            .collect();
        heads.sort_unstable();
        heads.into_iter().map(|(_, folder)| folder.clone()).collect()
    }

    /// 1-based position of an entry in its folder's queue
    pub fn position(&self, folder: &str, queue_id: &str) -> Option<usize> {
        self.queues
            .get(folder)?
            .iter()
            .position(|entry| entry.queue_id == queue_id)
            .map(|idx| idx + 1)
    }

    /// Pending count per folder
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(folder, queue)| (folder.clone(), queue.len()))
            .collect()
    }

    /// Pending entries per folder, in promotion order
    pub fn details(&self) -> BTreeMap<String, Vec<QueueEntryView>> {
        self.queues
            .iter()
            .map(|(folder, queue)| {
                let views = queue
                    .iter()
                    .enumerate()
                    .map(|(idx, entry)| QueueEntryView {
                        queue_id: entry.queue_id.clone(),
                        prompt: entry.prompt.clone(),
                        requester: entry.requester.clone(),
                        position: idx + 1,
                        enqueued_at: entry.enqueued_at,
                    })
                    .collect();
                (folder.clone(), views)
            })
            .collect()
    }
}
