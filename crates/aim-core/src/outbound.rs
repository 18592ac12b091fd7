//! Outbound messaging service.
//!
//! Send / edit / delete / clear / list / status / init-session. A send
//! builds the wire for a draft first so encryption failures surface before
//! any message ID is committed, persists the message as `pending`, and hands
//! the prepared wire to the dispatch queue. Listing implements read-on-view:
//! inbound `delivered` rows returned to the caller are flipped to `read`,
//! persisted, and notified — the side effect is part of the contract.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::{
    ContentType, ConversationType, Direction, Message, MessageStatus, PendingMessage,
};
use aim_common::notify::{METHOD_MESSAGE_NEW, METHOD_MESSAGE_STATUS};
use aim_common::policy;
use aim_session::PublicSessionState;

use crate::dispatch::DispatchQueue;
use crate::wiring::build_message_wire;
use crate::CoreContext;

/// How many fresh IDs a send tries before giving up on allocation.
const ID_ALLOCATION_ATTEMPTS: usize = 3;

/// The outbound service.
pub struct Messaging {
    ctx: Arc<CoreContext>,
    queue: Arc<DispatchQueue>,
}

impl Messaging {
    pub fn new(ctx: Arc<CoreContext>, queue: Arc<DispatchQueue>) -> Self {
        Self { ctx, queue }
    }

    /// Send a message to a contact.
    pub async fn send_message(&self, contact_id: &str, content: &str) -> CoreResult<Message> {
        self.send_internal(contact_id, content, None).await
    }

    /// Send a message inside a thread of the conversation.
    pub async fn send_message_in_thread(
        &self,
        contact_id: &str,
        content: &str,
        thread_id: &str,
    ) -> CoreResult<Message> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(CoreError::api("thread id is required"));
        }
        self.send_internal(contact_id, content, Some(thread_id.to_owned()))
            .await
    }

    async fn send_internal(
        &self,
        contact_id: &str,
        content: &str,
        thread_id: Option<String>,
    ) -> CoreResult<Message> {
        let (contact_id, content) = policy::validate_send_message_input(contact_id, content)?;
        if !self.ctx.kernel.has_contact(&contact_id) {
            return Err(CoreError::not_found("contact"));
        }

        // Draft first: any encryption failure must surface before an ID is
        // committed to the repository.
        let mut draft = Message {
            id: Uuid::new_v4(),
            contact_id: contact_id.clone(),
            conversation_id: contact_id.clone(),
            conversation_type: ConversationType::Direct,
            thread_id,
            content: content.into_bytes(),
            content_type: ContentType::Text,
            direction: Direction::Out,
            status: MessageStatus::Pending,
            edited: false,
            timestamp: Utc::now(),
        };
        let mut wire = build_message_wire(&self.ctx, &draft)?;

        // Allocate a unique ID; conflicts get a fresh ID and a re-signed wire.
        let mut attempts = 1;
        while !self.ctx.store.messages.insert(draft.clone()) {
            if attempts >= ID_ALLOCATION_ATTEMPTS {
                return Err(CoreError::MessageIdExhausted);
            }
            attempts += 1;
            draft.id = Uuid::new_v4();
            wire = build_message_wire(&self.ctx, &draft)?;
        }
        let message = draft;

        self.ctx.bus.publish(
            METHOD_MESSAGE_NEW,
            serde_json::json!({ "message": message }),
        );

        self.ctx
            .store
            .pending
            .enqueue(PendingMessage::new(message.id, contact_id, message.timestamp));
        self.queue.offer(message.id, wire);
        self.ctx.persister.checkpoint().await;

        tracing::debug!(message = %message.id, contact = %message.contact_id, "queued outbound message");
        Ok(message)
    }

    /// Edit an outbound message's content.
    pub async fn edit_message(
        &self,
        contact_id: &str,
        message_id: &str,
        content: &str,
    ) -> CoreResult<Message> {
        let (contact_id, message_id, content) =
            policy::validate_edit_message_input(contact_id, message_id, content)?;
        let existing = self.ctx.store.messages.get(&message_id);
        policy::ensure_editable_message(existing.as_ref(), &contact_id)?;

        let updated = self.ctx.store.messages.update_content(
            &message_id,
            content.into_bytes(),
            ContentType::Text,
        )?;
        self.ctx.bus.publish(
            METHOD_MESSAGE_STATUS,
            serde_json::json!({
                "message_id": message_id,
                "status": updated.status,
                "edited": true,
            }),
        );
        self.ctx.persister.checkpoint().await;
        Ok(updated)
    }

    /// Delete a message from the local log (and its pending row, if any).
    pub async fn delete_message(&self, contact_id: &str, message_id: &str) -> CoreResult<()> {
        let contact_id = policy::validate_contact_id(contact_id)?;
        let message_id = message_id
            .trim()
            .parse::<Uuid>()
            .map_err(|_| CoreError::api("malformed message id"))?;
        let Some(message) = self.ctx.store.messages.get(&message_id) else {
            return Err(CoreError::not_found("message"));
        };
        if message.contact_id != contact_id {
            return Err(CoreError::WrongContact);
        }

        self.ctx.store.pending.remove(&message_id);
        self.queue.discard(&message_id);
        self.ctx.store.messages.delete(&message_id);
        self.ctx.bus.publish(
            METHOD_MESSAGE_STATUS,
            serde_json::json!({ "message_id": message_id, "deleted": true }),
        );
        self.ctx.persister.checkpoint().await;
        Ok(())
    }

    /// Wipe a contact's conversation. Returns the number of removed messages.
    pub async fn clear_messages(&self, contact_id: &str) -> CoreResult<usize> {
        let contact_id = policy::validate_contact_id(contact_id)?;
        for id in self.ctx.store.pending.remove_contact(&contact_id) {
            self.queue.discard(&id);
        }
        let removed = self.ctx.store.messages.clear_contact(&contact_id);
        self.ctx.persister.checkpoint().await;
        Ok(removed)
    }

    /// List a contact's messages, marking returned inbound `delivered` rows
    /// as `read` (read-on-view).
    pub async fn get_messages(
        &self,
        contact_id: &str,
        limit: u32,
        offset: u32,
    ) -> CoreResult<Vec<Message>> {
        let contact_id = policy::validate_list_messages_input(contact_id, limit, offset)?;
        let messages =
            self.ctx
                .store
                .messages
                .list_by_contact(&contact_id, limit as usize, offset as usize);
        self.mark_read_on_view(messages).await
    }

    /// List one thread of a conversation, with the same read-on-view side
    /// effect as [`Messaging::get_messages`].
    pub async fn get_messages_by_thread(
        &self,
        contact_id: &str,
        thread_id: &str,
        limit: u32,
        offset: u32,
    ) -> CoreResult<Vec<Message>> {
        let contact_id = policy::validate_list_messages_input(contact_id, limit, offset)?;
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(CoreError::api("thread id is required"));
        }
        let messages = self.ctx.store.messages.list_by_thread(
            &contact_id,
            thread_id,
            limit as usize,
            offset as usize,
        );
        self.mark_read_on_view(messages).await
    }

    async fn mark_read_on_view(&self, mut messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        let unread = self.ctx.store.messages.unread_inbound_ids(&messages);
        if unread.is_empty() {
            return Ok(messages);
        }
        for id in &unread {
            if self.ctx.store.messages.advance_status(id, MessageStatus::Read)? {
                self.ctx.bus.publish(
                    METHOD_MESSAGE_STATUS,
                    serde_json::json!({ "message_id": id, "status": MessageStatus::Read, "edited": false }),
                );
            }
        }
        for message in &mut messages {
            if unread.contains(&message.id) {
                message.status = MessageStatus::Read;
            }
        }
        self.ctx.persister.checkpoint().await;
        Ok(messages)
    }

    /// Current status of a message.
    pub fn get_message_status(&self, message_id: &str) -> CoreResult<MessageStatus> {
        let message_id = message_id
            .trim()
            .parse::<Uuid>()
            .map_err(|_| CoreError::api("malformed message id"))?;
        self.ctx
            .store
            .messages
            .get(&message_id)
            .map(|m| m.status)
            .ok_or_else(|| CoreError::not_found("message"))
    }

    /// Establish a ratchet session with a verified contact.
    pub fn init_session(
        &self,
        contact_id: &str,
        peer_public_key: &[u8],
    ) -> CoreResult<PublicSessionState> {
        let contact_id = policy::validate_contact_id(contact_id)?;
        let contact = self
            .ctx
            .kernel
            .contact(&contact_id)
            .ok_or_else(|| CoreError::not_found("contact"))?;
        if !contact.is_verified() {
            return Err(CoreError::api("contact is not verified"));
        }
        self.ctx.sessions.init_session(&contact_id, peer_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connected_pair, establish_sessions};
    use aim_common::wire::WireKind;

    #[tokio::test]
    async fn handshake_send_is_plain_with_card_and_pending_row() {
        let (alice, bob, _transport) = connected_pair();

        let message = alice.messaging.send_message(&bob.id, "hi").await.unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.direction, Direction::Out);

        // One pending row, status pending, before any publish attempt.
        assert_eq!(alice.ctx.store.pending.len(), 1);
        let stored = alice.ctx.store.messages.get(&message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);

        // The prepared wire is the handshake shape: plain + card + device sig.
        let wire = alice.queue.take(&message.id).unwrap();
        assert_eq!(wire.kind, WireKind::Plain);
        assert_eq!(wire.plain.as_deref(), Some(b"hi".as_slice()));
        assert_eq!(wire.card.unwrap().identity_id, alice.id);
        assert!(wire.device.is_some());
        assert!(wire.device_sig.is_some());
    }

    #[tokio::test]
    async fn send_with_session_produces_e2ee_wire() {
        let (alice, bob, _transport) = connected_pair();
        establish_sessions(&alice, &bob);

        let message = alice.messaging.send_message(&bob.id, "secret").await.unwrap();
        let wire = alice.queue.take(&message.id).unwrap();
        assert_eq!(wire.kind, WireKind::E2ee);
        assert!(wire.envelope.is_some());
        assert!(wire.plain.is_none());
        assert!(wire.card.is_none());
    }

    #[tokio::test]
    async fn send_requires_known_contact() {
        let (alice, _bob, _transport) = connected_pair();
        let err = alice
            .messaging
            .send_message("aim1strangerrr", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "contact not found");
    }

    #[tokio::test]
    async fn edit_constraints_match_contract() {
        let (alice, bob, _transport) = connected_pair();

        // An inbound message may not be edited.
        let inbound = Message {
            id: Uuid::new_v4(),
            contact_id: bob.id.clone(),
            conversation_id: bob.id.clone(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"from bob".to_vec(),
            content_type: ContentType::Text,
            direction: Direction::In,
            status: MessageStatus::Delivered,
            edited: false,
            timestamp: Utc::now(),
        };
        alice.ctx.store.messages.insert(inbound.clone());
        let err = alice
            .messaging
            .edit_message(&bob.id, &inbound.id.to_string(), "nope")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "only outbound messages can be edited");

        // An outbound message may not be edited under the wrong contact.
        let sent = alice.messaging.send_message(&bob.id, "mine").await.unwrap();
        let err = alice
            .messaging
            .edit_message("aim1zzzzzzzzzz", &sent.id.to_string(), "oops")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "message does not belong to contact");

        // The happy path edits content and flags the message.
        let edited = alice
            .messaging
            .edit_message(&bob.id, &sent.id.to_string(), "mine, fixed")
            .await
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.content, b"mine, fixed");
    }

    #[tokio::test]
    async fn get_messages_marks_inbound_delivered_as_read() {
        let (alice, bob, _transport) = connected_pair();
        let inbound = Message {
            id: Uuid::new_v4(),
            contact_id: bob.id.clone(),
            conversation_id: bob.id.clone(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"unread".to_vec(),
            content_type: ContentType::Text,
            direction: Direction::In,
            status: MessageStatus::Delivered,
            edited: false,
            timestamp: Utc::now(),
        };
        alice.ctx.store.messages.insert(inbound.clone());

        let listed = alice.messaging.get_messages(&bob.id, 100, 0).await.unwrap();
        assert_eq!(listed[0].status, MessageStatus::Read);
        // The flip is persisted, not just projected.
        assert_eq!(
            alice.ctx.store.messages.get(&inbound.id).unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn thread_send_and_listing() {
        let (alice, bob, _transport) = connected_pair();
        alice
            .messaging
            .send_message_in_thread(&bob.id, "threaded", "t-1")
            .await
            .unwrap();
        alice.messaging.send_message(&bob.id, "top level").await.unwrap();

        let thread = alice
            .messaging
            .get_messages_by_thread(&bob.id, "t-1", 100, 0)
            .await
            .unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].content, b"threaded");
        assert_eq!(thread[0].thread_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn init_session_requires_verified_contact() {
        let (alice, _bob, _transport) = connected_pair();
        alice
            .ctx
            .kernel
            .add_contact_by_id("aim1unverified", "mystery")
            .unwrap();
        let err = alice
            .messaging
            .init_session("aim1unverified", &[0u8; 32])
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed: contact is not verified");
    }

    #[tokio::test]
    async fn delete_message_removes_pending_row() {
        let (alice, bob, _transport) = connected_pair();
        let message = alice.messaging.send_message(&bob.id, "oops").await.unwrap();
        assert_eq!(alice.ctx.store.pending.len(), 1);

        alice
            .messaging
            .delete_message(&bob.id, &message.id.to_string())
            .await
            .unwrap();
        assert!(alice.ctx.store.pending.is_empty());
        assert!(alice.ctx.store.messages.get(&message.id).is_none());
        assert!(alice.queue.take(&message.id).is_none());
    }

    #[tokio::test]
    async fn message_status_is_queryable() {
        let (alice, bob, _transport) = connected_pair();
        let message = alice.messaging.send_message(&bob.id, "hi").await.unwrap();
        assert_eq!(
            alice.messaging.get_message_status(&message.id.to_string()).unwrap(),
            MessageStatus::Pending
        );
    }
}
