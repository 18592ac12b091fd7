//! Message repository — the persisted message log.
//!
//! Idempotent by message ID; status transitions are enforced monotonic at
//! this layer so no caller can walk a message backwards. Listing projects a
//! conversation (or a thread within it) in insertion order, which is also
//! per-contact chronological order since IDs are allocated at send/persist
//! time.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::{ContentType, Direction, Message, MessageStatus};

/// Serializable repository content, persisted inside the state envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageLogSnapshot {
    /// Messages in insertion order.
    pub messages: Vec<Message>,
}

#[derive(Default)]
struct LogInner {
    by_id: BTreeMap<Uuid, Message>,
    /// Insertion order of message IDs.
    order: Vec<Uuid>,
}

/// In-memory message log with envelope-backed persistence.
#[derive(Default)]
pub struct MessageRepository {
    inner: RwLock<LogInner>,
}

impl MessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message if its ID is unused. Returns `true` on a fresh
    /// insert and `false` when the ID already exists (idempotent replay).
    pub fn insert(&self, message: Message) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&message.id) {
            return false;
        }
        inner.order.push(message.id);
        inner.by_id.insert(message.id, message);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<Message> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance a message's status, holding the monotonic ladder.
    ///
    /// Returns `Ok(true)` when the status moved, `Ok(false)` when the
    /// transition would go backwards (ignored) or the message is unknown.
    pub fn advance_status(&self, id: &Uuid, status: MessageStatus) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let Some(message) = inner.by_id.get_mut(id) else {
            return Ok(false);
        };
        if !message.status.can_advance_to(status) {
            return Ok(false);
        }
        message.status = status;
        Ok(true)
    }

    /// Replace a message's content atomically (edit path).
    pub fn update_content(
        &self,
        id: &Uuid,
        content: Vec<u8>,
        content_type: ContentType,
    ) -> CoreResult<Message> {
        let mut inner = self.inner.write();
        let message = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("message"))?;
        message.content = content;
        message.content_type = content_type;
        message.edited = true;
        Ok(message.clone())
    }

    /// List a contact's messages in insertion order with pagination.
    pub fn list_by_contact(&self, contact_id: &str, limit: usize, offset: usize) -> Vec<Message> {
        self.project(|m| m.contact_id == contact_id, limit, offset)
    }

    /// List messages of one thread within a contact's conversation.
    pub fn list_by_thread(
        &self,
        contact_id: &str,
        thread_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<Message> {
        self.project(
            |m| m.contact_id == contact_id && m.thread_id.as_deref() == Some(thread_id),
            limit,
            offset,
        )
    }

    fn project(&self, keep: impl Fn(&Message) -> bool, limit: usize, offset: usize) -> Vec<Message> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|m| keep(m))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Inbound messages a list call should flip from `delivered` to `read`.
    pub fn unread_inbound_ids(&self, messages: &[Message]) -> Vec<Uuid> {
        messages
            .iter()
            .filter(|m| m.direction == Direction::In && m.status == MessageStatus::Delivered)
            .map(|m| m.id)
            .collect()
    }

    pub fn delete(&self, id: &Uuid) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.remove(id).is_none() {
            return false;
        }
        inner.order.retain(|mid| mid != id);
        true
    }

    /// Remove every message of a contact's conversation. Returns the count.
    pub fn clear_contact(&self, contact_id: &str) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<Uuid> = inner
            .by_id
            .values()
            .filter(|m| m.contact_id == contact_id)
            .map(|m| m.id)
            .collect();
        for id in &doomed {
            inner.by_id.remove(id);
        }
        inner.order.retain(|id| !doomed.contains(id));
        doomed.len()
    }

    pub fn snapshot(&self) -> MessageLogSnapshot {
        let inner = self.inner.read();
        MessageLogSnapshot {
            messages: inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id))
                .cloned()
                .collect(),
        }
    }

    pub fn restore(&self, snapshot: MessageLogSnapshot) {
        let mut inner = self.inner.write();
        inner.by_id.clear();
        inner.order.clear();
        for message in snapshot.messages {
            inner.order.push(message.id);
            inner.by_id.insert(message.id, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_common::models::ConversationType;
    use chrono::Utc;

    fn message(contact: &str, direction: Direction, status: MessageStatus) -> Message {
        Message {
            id: Uuid::new_v4(),
            contact_id: contact.into(),
            conversation_id: contact.into(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"hi".to_vec(),
            content_type: ContentType::Text,
            direction,
            status,
            edited: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn insert_is_idempotent_by_id() {
        let repo = MessageRepository::new();
        let msg = message("aim1bob", Direction::Out, MessageStatus::Pending);
        assert!(repo.insert(msg.clone()));
        assert!(!repo.insert(msg));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn status_never_walks_backwards() {
        let repo = MessageRepository::new();
        let msg = message("aim1bob", Direction::Out, MessageStatus::Pending);
        let id = msg.id;
        repo.insert(msg);

        assert!(repo.advance_status(&id, MessageStatus::Sent).unwrap());
        assert!(repo.advance_status(&id, MessageStatus::Read).unwrap());
        assert!(!repo.advance_status(&id, MessageStatus::Delivered).unwrap());
        assert_eq!(repo.get(&id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn unknown_message_status_update_is_a_noop() {
        let repo = MessageRepository::new();
        assert!(!repo
            .advance_status(&Uuid::new_v4(), MessageStatus::Read)
            .unwrap());
    }

    #[test]
    fn listing_respects_insertion_order_and_pagination() {
        let repo = MessageRepository::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let msg = message("aim1bob", Direction::Out, MessageStatus::Sent);
            ids.push(msg.id);
            repo.insert(msg);
        }
        repo.insert(message("aim1carol", Direction::Out, MessageStatus::Sent));

        let page = repo.list_by_contact("aim1bob", 2, 1);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[1]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[test]
    fn thread_projection_filters_by_thread() {
        let repo = MessageRepository::new();
        let mut threaded = message("aim1bob", Direction::Out, MessageStatus::Sent);
        threaded.thread_id = Some("t-1".into());
        let tid = threaded.id;
        repo.insert(threaded);
        repo.insert(message("aim1bob", Direction::Out, MessageStatus::Sent));

        let thread = repo.list_by_thread("aim1bob", "t-1", 100, 0);
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, tid);
    }

    #[test]
    fn clear_contact_removes_only_that_conversation() {
        let repo = MessageRepository::new();
        repo.insert(message("aim1bob", Direction::In, MessageStatus::Delivered));
        repo.insert(message("aim1carol", Direction::In, MessageStatus::Delivered));
        assert_eq!(repo.clear_contact("aim1bob"), 1);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let repo = MessageRepository::new();
        for _ in 0..3 {
            repo.insert(message("aim1bob", Direction::Out, MessageStatus::Sent));
        }
        let snapshot = repo.snapshot();
        let restored = MessageRepository::new();
        restored.restore(snapshot.clone());
        assert_eq!(restored.snapshot().messages.len(), 3);
        assert_eq!(
            restored.list_by_contact("aim1bob", 100, 0),
            repo.list_by_contact("aim1bob", 100, 0)
        );
    }
}
