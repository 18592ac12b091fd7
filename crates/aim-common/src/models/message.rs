//! Message and pending-queue models.
//!
//! A message ID is the primary key across all conversations. Outbound
//! messages start `pending` and advance monotonically through
//! `sent → delivered → read`; inbound messages are stored `delivered` and may
//! advance to `read`. Direction never changes after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::b64;

/// Which conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    #[default]
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// How the stored content bytes are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Text,
    E2ee,
    /// Terminal state: ciphertext that failed to decrypt, retained verbatim.
    E2eeUnreadable,
}

/// Message direction, immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the monotonic delivery ladder. `Failed` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether a transition `self → next` is allowed.
    ///
    /// Ladder statuses only move forward; `Failed` is reachable from
    /// `Pending` alone (a pending row abandoned by the dispatch loop).
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(a), Some(b)) => b > a,
            (Some(0), None) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,

    /// The peer this message was exchanged with.
    pub contact_id: String,

    pub conversation_id: String,
    pub conversation_type: ConversationType,

    /// Optional thread within the conversation.
    pub thread_id: Option<String>,

    /// Opaque content bytes — passed through unchanged, never re-encoded.
    #[serde(with = "b64")]
    pub content: Vec<u8>,

    pub content_type: ContentType,
    pub direction: Direction,
    pub status: MessageStatus,

    /// Whether this message has been edited.
    pub edited: bool,

    pub timestamp: DateTime<Utc>,
}

/// Receipt status carried in a `receipt` wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_message_status(&self) -> MessageStatus {
        match self {
            Self::Delivered => MessageStatus::Delivered,
            Self::Read => MessageStatus::Read,
        }
    }
}

/// Delivery/read acknowledgement for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: Uuid,
    pub status: ReceiptStatus,
}

/// An outbound message awaiting a successful transport publish.
///
/// Owned by the repository; the dispatch loop only ever touches the retry
/// counter, the next-retry instant and the last-error record. Survives
/// process restarts through the state envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub message_id: Uuid,
    pub contact_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PendingMessage {
    pub fn new(message_id: Uuid, contact_id: String, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            contact_id,
            enqueued_at: now,
            retry_count: 0,
            next_retry: now,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ladder_is_monotonic() {
        assert!(MessageStatus::Pending.can_advance_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Pending.can_advance_to(MessageStatus::Read));

        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Sent));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Pending));
    }

    #[test]
    fn only_pending_can_fail() {
        assert!(MessageStatus::Pending.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.can_advance_to(MessageStatus::Sent));
    }

    #[test]
    fn content_type_serializes_kebab_case() {
        let json = serde_json::to_string(&ContentType::E2eeUnreadable).unwrap();
        assert_eq!(json, "\"e2ee-unreadable\"");
        let json = serde_json::to_string(&ContentType::E2ee).unwrap();
        assert_eq!(json, "\"e2ee\"");
    }
}
