//! Inbound processing state machine.
//!
//! Every transport message runs the same pipeline: policy gate → wire
//! decode/validate → trust continuity → control messages → device auth →
//! group routing → receipt handling → content resolution → persist +
//! delivered receipt. Each step returns a tagged verdict; the first verdict
//! that halts the pipeline decides the [`InboundOutcome`], which makes the
//! ladder exhaustively testable.
//!
//! The transport subscription serializes calls per sender; different
//! senders may be processed in parallel.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aim_common::error::{record_error, CoreError, CoreResult, ErrorCategory};
use aim_common::models::{
    ContactCard, ContentType, ConversationType, Direction, Message, MessageStatus, Receipt,
    ReceiptStatus,
};
use aim_common::notify::{
    ALERT_CONTACT_KEY_PIN_MISMATCH, ALERT_UNVERIFIED_SENDER_MISSING_CARD, METHOD_MESSAGE_NEW,
    METHOD_MESSAGE_STATUS, METHOD_SECURITY_ALERT,
};
use aim_common::wire::{
    build_auth_payload, validate_wire_payload, WireKind, WirePayload, CONVERSATION_TYPE_GROUP,
};
use aim_session::RatchetEnvelope;

use crate::collab::{MessageRequestStore, PolicyDecision, PrivacyPolicy};
use crate::transport::PrivateMessage;
use crate::wiring::build_receipt_wire;
use crate::CoreContext;

/// Where the pipeline ended for one inbound transport message.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Policy rejected the sender.
    Rejected,
    /// Stored into the message-request flow.
    Queued,
    /// A halted pipeline step; the message was not persisted.
    Dropped { reason: &'static str },
    /// A device revocation was applied.
    RevocationApplied,
    /// Handed to the group collaborator.
    GroupRouted,
    /// A receipt updated (or failed to find) its referenced message.
    ReceiptApplied { message_id: Uuid, updated: bool },
    /// Persisted as a regular inbound message.
    Stored { message_id: Uuid, fresh: bool },
}

/// Resolved content on its way into the repository.
struct ResolvedContent {
    content: Vec<u8>,
    content_type: ContentType,
}

/// The inbound service.
pub struct Inbound {
    ctx: Arc<CoreContext>,
    policy: Arc<dyn PrivacyPolicy>,
    requests: Arc<dyn MessageRequestStore>,
}

impl Inbound {
    pub fn new(
        ctx: Arc<CoreContext>,
        policy: Arc<dyn PrivacyPolicy>,
        requests: Arc<dyn MessageRequestStore>,
    ) -> Self {
        Self { ctx, policy, requests }
    }

    /// Process one inbound transport message.
    pub async fn handle(&self, msg: PrivateMessage) -> InboundOutcome {
        // 1. Policy gate.
        match self.policy.decide(&msg.sender_id) {
            PolicyDecision::Reject => {
                record_error(
                    ErrorCategory::Crypto,
                    &CoreError::crypto(format!("sender {} rejected by policy", msg.sender_id)),
                );
                return InboundOutcome::Rejected;
            }
            PolicyDecision::Queue => return self.handle_request(msg).await,
            PolicyDecision::Accept => {}
        }

        // 2. Wire decode & validate. A parse failure is a legacy/foreign
        // sender: fall through and store the raw payload as text.
        let wire = match WirePayload::decode(&msg.payload) {
            Ok(wire) => wire,
            Err(_) => {
                let content = ResolvedContent {
                    content: msg.payload.clone(),
                    content_type: ContentType::Text,
                };
                return self.persist(&msg, None, content).await;
            }
        };
        if let Err(err) = validate_wire_payload(&wire, self.ctx.groups.known_event_types()) {
            record_error(ErrorCategory::Api, &err);
            return InboundOutcome::Dropped { reason: "invalid wire payload" };
        }

        // 3. Trust continuity.
        if let Some(halt) = self.check_trust(&msg.sender_id, wire.card.as_ref()) {
            return halt;
        }

        // 4. Control messages.
        if wire.kind == WireKind::DeviceRevoke {
            return self.apply_revocation(&msg.sender_id, &wire).await;
        }

        // 5. Device authentication.
        if !self.policy.bypass_device_auth() {
            if let Some(halt) = self.authenticate_device(&msg, &wire) {
                return halt;
            }
        }

        // 6. Group routing.
        if wire.conversation_type.as_deref() == Some(CONVERSATION_TYPE_GROUP) {
            return match self.ctx.groups.route(&msg.sender_id, &wire).await {
                Ok(()) => InboundOutcome::GroupRouted,
                Err(err) => {
                    record_error(err.category(), &err);
                    InboundOutcome::Dropped { reason: "group routing failed" }
                }
            };
        }

        // 7. Receipt handling.
        if wire.kind == WireKind::Receipt {
            return self.apply_receipt(wire.receipt.as_ref()).await;
        }

        // 8–9. Content resolution and persistence.
        let content = self.resolve_content(&msg, &wire);
        self.persist(&msg, Some(&wire), content).await
    }

    /// Message-request flow for `queue` verdicts: trust continuity, device
    /// auth, and group routing are skipped; receipts still stop the
    /// pipeline; storage goes to the message-requests collaborator.
    async fn handle_request(&self, msg: PrivateMessage) -> InboundOutcome {
        let wire = match WirePayload::decode(&msg.payload) {
            Ok(wire) => wire,
            Err(_) => {
                let message = self.build_message(
                    &msg,
                    None,
                    ResolvedContent { content: msg.payload.clone(), content_type: ContentType::Text },
                );
                self.requests.store(message);
                return InboundOutcome::Queued;
            }
        };
        if let Err(err) = validate_wire_payload(&wire, self.ctx.groups.known_event_types()) {
            record_error(ErrorCategory::Api, &err);
            return InboundOutcome::Dropped { reason: "invalid wire payload" };
        }
        if wire.kind == WireKind::DeviceRevoke {
            return self.apply_revocation(&msg.sender_id, &wire).await;
        }
        if wire.kind == WireKind::Receipt {
            return self.apply_receipt(wire.receipt.as_ref()).await;
        }

        let content = self.resolve_content(&msg, &wire);
        let message = self.build_message(&msg, Some(&wire), content);
        let id = message.id;
        self.requests.store(message);
        tracing::debug!(message = %id, sender = %msg.sender_id, "queued message request");
        InboundOutcome::Queued
    }

    /// Step 3: pinned-key continuity between the sender and any attached card.
    fn check_trust(&self, sender_id: &str, card: Option<&ContactCard>) -> Option<InboundOutcome> {
        let contact = self.ctx.kernel.contact(sender_id);
        let verified = contact.as_ref().is_some_and(|c| c.is_verified());

        // Inside an accepted context the policy may vouch for unknown
        // senders; they are inserted as lightweight contacts and the card
        // checks are skipped for this step.
        if !verified && self.policy.auto_add_unknown_senders() {
            if contact.is_none() {
                if let Err(err) = self.ctx.kernel.add_contact_by_id(sender_id, sender_id) {
                    record_error(err.category(), &err);
                    return Some(InboundOutcome::Dropped { reason: "sender auto-add failed" });
                }
            }
            return None;
        }

        match (verified, card) {
            (true, Some(card)) => {
                if let Err(err) = aim_identity::verify_contact_card(card) {
                    record_error(ErrorCategory::Crypto, &err);
                    return Some(InboundOutcome::Dropped { reason: "card verification failed" });
                }
                let pinned = contact.expect("verified implies contact").public_key;
                if card.public_key != pinned {
                    let err = CoreError::ContactKeyMismatch;
                    record_error(ErrorCategory::Crypto, &err);
                    self.ctx.bus.publish(
                        METHOD_SECURITY_ALERT,
                        serde_json::json!({
                            "code": ALERT_CONTACT_KEY_PIN_MISMATCH,
                            "contact_id": sender_id,
                        }),
                    );
                    return Some(InboundOutcome::Dropped {
                        reason: ALERT_CONTACT_KEY_PIN_MISMATCH,
                    });
                }
                None
            }
            (true, None) => None,
            (false, Some(card)) => {
                if card.identity_id != sender_id {
                    let err = CoreError::crypto("card does not belong to sender");
                    record_error(ErrorCategory::Crypto, &err);
                    return Some(InboundOutcome::Dropped { reason: "card sender mismatch" });
                }
                // First verified card pins the key.
                match self.ctx.kernel.add_contact(card) {
                    Ok(_) => None,
                    Err(err) => {
                        record_error(err.category(), &err);
                        Some(InboundOutcome::Dropped { reason: "card rejected" })
                    }
                }
            }
            (false, None) => {
                let err = CoreError::UnverifiedSenderMissingCard;
                record_error(ErrorCategory::Crypto, &err);
                Some(InboundOutcome::Dropped {
                    reason: ALERT_UNVERIFIED_SENDER_MISSING_CARD,
                })
            }
        }
    }

    /// Step 4: apply a device revocation and stop.
    async fn apply_revocation(&self, sender_id: &str, wire: &WirePayload) -> InboundOutcome {
        let Some(revocation) = wire.revocation.as_ref() else {
            record_error(
                ErrorCategory::Api,
                &CoreError::api("device_revoke wire without revocation"),
            );
            return InboundOutcome::Dropped { reason: "missing revocation" };
        };
        match self.ctx.kernel.apply_device_revocation(sender_id, revocation) {
            Ok(()) => {
                self.ctx.bus.publish(
                    aim_common::notify::METHOD_DEVICE_UPDATED,
                    serde_json::json!({
                        "contact_id": sender_id,
                        "revoked_device_id": revocation.device_id,
                    }),
                );
                self.ctx.persister.checkpoint().await;
                InboundOutcome::RevocationApplied
            }
            Err(err) => {
                record_error(err.category(), &err);
                InboundOutcome::Dropped { reason: "revocation rejected" }
            }
        }
    }

    /// Step 5: verify the active-device signature over the rebuilt auth bytes.
    fn authenticate_device(&self, msg: &PrivateMessage, wire: &WirePayload) -> Option<InboundOutcome> {
        let (Some(device), Some(signature)) = (wire.device.as_ref(), wire.device_sig.as_ref())
        else {
            record_error(
                ErrorCategory::Crypto,
                &CoreError::crypto("wire is missing device authentication"),
            );
            return Some(InboundOutcome::Dropped { reason: "missing device auth" });
        };

        let auth = match build_auth_payload(&msg.id, &msg.sender_id, &msg.recipient_id, wire) {
            Ok(auth) => auth,
            Err(err) => {
                record_error(err.category(), &err);
                return Some(InboundOutcome::Dropped { reason: "auth payload rebuild failed" });
            }
        };
        if let Err(err) =
            self.ctx
                .kernel
                .verify_inbound_device(&msg.sender_id, device, &auth, signature)
        {
            record_error(ErrorCategory::Crypto, &err);
            return Some(InboundOutcome::Dropped { reason: "device auth failed" });
        }
        None
    }

    /// Step 7: apply a delivered/read receipt to the referenced message.
    async fn apply_receipt(&self, receipt: Option<&Receipt>) -> InboundOutcome {
        let Some(receipt) = receipt else {
            return InboundOutcome::Dropped { reason: "receipt wire without receipt" };
        };
        let status = receipt.status.as_message_status();
        let updated = self
            .ctx
            .store
            .messages
            .advance_status(&receipt.message_id, status)
            .unwrap_or(false);
        if updated {
            self.ctx.bus.publish(
                METHOD_MESSAGE_STATUS,
                serde_json::json!({
                    "message_id": receipt.message_id,
                    "status": status,
                    "edited": false,
                }),
            );
            self.ctx.persister.checkpoint().await;
        }
        InboundOutcome::ReceiptApplied { message_id: receipt.message_id, updated }
    }

    /// Step 8: turn the wire into storable content bytes.
    fn resolve_content(&self, msg: &PrivateMessage, wire: &WirePayload) -> ResolvedContent {
        match wire.kind {
            WireKind::E2ee => {
                let envelope: Option<RatchetEnvelope> = wire
                    .envelope
                    .clone()
                    .and_then(|v| serde_json::from_value(v).ok());
                match &envelope {
                    Some(envelope) => {
                        match self.ctx.sessions.decrypt(&msg.sender_id, envelope) {
                            Ok(plaintext) => ResolvedContent {
                                content: plaintext,
                                content_type: ContentType::E2ee,
                            },
                            Err(err) => {
                                record_error(ErrorCategory::Crypto, &err);
                                // Keep the ciphertext verbatim for forensics.
                                ResolvedContent {
                                    content: envelope.ciphertext.clone(),
                                    content_type: ContentType::E2eeUnreadable,
                                }
                            }
                        }
                    }
                    None => {
                        record_error(
                            ErrorCategory::Crypto,
                            &CoreError::crypto("e2ee wire without a parseable envelope"),
                        );
                        ResolvedContent {
                            content: msg.payload.clone(),
                            content_type: ContentType::E2eeUnreadable,
                        }
                    }
                }
            }
            WireKind::Plain => ResolvedContent {
                content: wire.plain.clone().unwrap_or_default(),
                content_type: ContentType::Text,
            },
            // Control kinds never reach content resolution.
            WireKind::Receipt | WireKind::DeviceRevoke => ResolvedContent {
                content: msg.payload.clone(),
                content_type: ContentType::Text,
            },
        }
    }

    fn build_message(
        &self,
        msg: &PrivateMessage,
        wire: Option<&WirePayload>,
        content: ResolvedContent,
    ) -> Message {
        Message {
            id: msg.id,
            contact_id: msg.sender_id.clone(),
            conversation_id: wire
                .and_then(|w| w.conversation_id.clone())
                .unwrap_or_else(|| msg.sender_id.clone()),
            conversation_type: ConversationType::Direct,
            thread_id: wire.and_then(|w| w.thread_id.clone()),
            content: content.content,
            content_type: content.content_type,
            direction: Direction::In,
            status: MessageStatus::Delivered,
            edited: false,
            timestamp: Utc::now(),
        }
    }

    /// Step 9: persist and, for fresh inserts from verified senders, send a
    /// `delivered` receipt back through the outbound path.
    async fn persist(
        &self,
        msg: &PrivateMessage,
        wire: Option<&WirePayload>,
        content: ResolvedContent,
    ) -> InboundOutcome {
        let message = self.build_message(msg, wire, content);
        let message_id = message.id;
        let fresh = self.ctx.store.messages.insert(message.clone());

        if fresh {
            self.ctx.kernel.touch_contact(&msg.sender_id);
            self.ctx
                .bus
                .publish(METHOD_MESSAGE_NEW, serde_json::json!({ "message": message }));
            self.ctx.persister.checkpoint().await;

            let sender_verified = self
                .ctx
                .kernel
                .contact(&msg.sender_id)
                .is_some_and(|c| c.is_verified());
            if sender_verified {
                self.send_delivered_receipt(&msg.sender_id, message_id).await;
            }
        }

        InboundOutcome::Stored { message_id, fresh }
    }

    /// Receipt publish failures are recorded as `network` and never block
    /// inbound processing.
    async fn send_delivered_receipt(&self, contact_id: &str, message_id: Uuid) {
        let result: CoreResult<()> = async {
            let wire_id = Uuid::new_v4();
            let wire = build_receipt_wire(
                &self.ctx,
                &wire_id,
                contact_id,
                Receipt { message_id, status: ReceiptStatus::Delivered },
            )?;
            let sender_id = self.ctx.kernel.require_identity()?.id;
            let payload = wire
                .encode()
                .map_err(|e| CoreError::api(format!("wire serialization: {e}")))?;
            self.ctx
                .transport
                .publish_private(PrivateMessage {
                    id: wire_id,
                    sender_id,
                    recipient_id: contact_id.to_owned(),
                    payload,
                })
                .await
        }
        .await;

        if let Err(err) = result {
            record_error(ErrorCategory::Network, &err);
            tracing::debug!(contact = contact_id, error = %err, "delivered receipt not published");
        }
    }
}
