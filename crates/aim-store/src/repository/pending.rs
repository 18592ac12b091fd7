//! Pending-send queue.
//!
//! The repository owns every pending row; the dispatch loop is a pure
//! consumer that only ever updates retry metadata or removes rows. Rows are
//! kept in insertion order, and the due-scan never releases a later row for
//! a contact while an earlier row of the same contact is still waiting —
//! that is what keeps per-contact delivery ordered across retries.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aim_common::models::PendingMessage;

/// Serializable queue content, persisted inside the state envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingQueueSnapshot {
    pub entries: Vec<PendingMessage>,
}

/// Insertion-ordered pending queue.
#[derive(Default)]
pub struct PendingQueue {
    inner: RwLock<Vec<PendingMessage>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a freshly queued message.
    pub fn enqueue(&self, entry: PendingMessage) {
        self.inner.write().push(entry);
    }

    /// Rows ready for a publish attempt at `now`, in insertion order.
    ///
    /// A contact whose head-of-queue row is not yet due contributes nothing;
    /// later rows of that contact stay blocked behind it.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<PendingMessage> {
        let inner = self.inner.read();
        let mut blocked: BTreeSet<&str> = BTreeSet::new();
        let mut ready = Vec::new();
        for entry in inner.iter() {
            if blocked.contains(entry.contact_id.as_str()) {
                continue;
            }
            if entry.next_retry <= now {
                ready.push(entry.clone());
            } else {
                blocked.insert(entry.contact_id.as_str());
            }
        }
        ready
    }

    /// Rows whose `next_retry` falls inside `now ± lookahead` — the startup
    /// recovery window.
    pub fn within_window(
        &self,
        now: DateTime<Utc>,
        lookahead: chrono::Duration,
    ) -> Vec<PendingMessage> {
        let inner = self.inner.read();
        inner
            .iter()
            .filter(|e| e.next_retry >= now - lookahead && e.next_retry <= now + lookahead)
            .cloned()
            .collect()
    }

    /// Persist updated retry metadata for a row.
    pub fn update(&self, entry: &PendingMessage) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.iter_mut().find(|e| e.message_id == entry.message_id) {
            *existing = entry.clone();
        }
    }

    /// Remove a row after a successful publish (or abandonment).
    pub fn remove(&self, message_id: &Uuid) -> bool {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|e| e.message_id != *message_id);
        inner.len() != before
    }

    /// Drop every row belonging to a contact. Returns removed IDs.
    pub fn remove_contact(&self, contact_id: &str) -> Vec<Uuid> {
        let mut inner = self.inner.write();
        let doomed: Vec<Uuid> = inner
            .iter()
            .filter(|e| e.contact_id == contact_id)
            .map(|e| e.message_id)
            .collect();
        inner.retain(|e| e.contact_id != contact_id);
        doomed
    }

    pub fn contains(&self, message_id: &Uuid) -> bool {
        self.inner.read().iter().any(|e| e.message_id == *message_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> PendingQueueSnapshot {
        PendingQueueSnapshot { entries: self.inner.read().clone() }
    }

    pub fn restore(&self, snapshot: PendingQueueSnapshot) {
        *self.inner.write() = snapshot.entries;
    }
}
