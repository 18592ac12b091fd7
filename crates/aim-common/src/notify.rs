//! Notification event type — shared between the service crates and the bus.
//!
//! Lives in `aim-common` so services can build events without depending on
//! the bus implementation. Sequence numbers are assigned by the bus at
//! publish time and are strictly monotonic across the whole process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A new message was stored (outbound allocation or inbound persist).
pub const METHOD_MESSAGE_NEW: &str = "notify.message.new";
/// A message changed status or content (sent/delivered/read/failed/edited).
pub const METHOD_MESSAGE_STATUS: &str = "notify.message.status";
/// A trust violation or other security-relevant condition.
pub const METHOD_SECURITY_ALERT: &str = "notify.security.alert";
/// A contact was added or updated.
pub const METHOD_CONTACT_UPDATED: &str = "notify.contact.updated";
/// A device was added or revoked.
pub const METHOD_DEVICE_UPDATED: &str = "notify.device.updated";

/// Security-alert code for a pinned-key continuity violation.
pub const ALERT_CONTACT_KEY_PIN_MISMATCH: &str = "contact_key_pin_mismatch";
/// Security-alert code for an unverified sender that sent no card.
pub const ALERT_UNVERIFIED_SENDER_MISSING_CARD: &str = "unverified_sender_missing_card";

/// One event on the notification bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Monotonic, process-local sequence number.
    pub seq: u64,
    /// Notification method name (`notify.…`).
    pub method: String,
    /// Opaque payload forwarded to subscribers.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
