//! Wire codec & auth-payload builder.
//!
//! The on-the-wire envelope is a tagged JSON object (`kind` ∈ plain / e2ee /
//! receipt / device_revoke) carried opaquely by the anonymous transport. The
//! active device signs the canonical serialization produced by
//! [`build_auth_payload`]: field order fixed, no whitespace, optional fields
//! omitted when absent.
//!
//! [`validate_wire_payload`] must run both before signing an outbound wire
//! and immediately after JSON-decoding an inbound one; failure is fatal for
//! that message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{b64, ContactCard, Device, DeviceRevocation, Receipt};

/// Conversation-type literal accepted on the wire for group traffic.
pub const CONVERSATION_TYPE_GROUP: &str = "group";
/// Conversation-type literal for one-to-one traffic (also the empty default).
pub const CONVERSATION_TYPE_DIRECT: &str = "direct";
/// Group event type that carries an encrypted member message.
pub const GROUP_EVENT_MESSAGE: &str = "message";

/// Discriminant of a [`WirePayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireKind {
    Plain,
    E2ee,
    Receipt,
    DeviceRevoke,
}

/// The envelope carried by the anonymous transport.
///
/// All optional fields are elided from JSON when unset. `envelope` is the
/// session layer's ciphertext object and stays opaque at this level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePayload {
    pub kind: WireKind,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub envelope: Option<serde_json::Value>,

    #[serde(with = "b64::opt", skip_serializing_if = "Option::is_none", default)]
    pub plain: Option<Vec<u8>>,

    /// Random filler so ciphertext length does not leak message length.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub padding: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thread_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub membership_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_key_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_device_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub card: Option<ContactCard>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub receipt: Option<Receipt>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device: Option<Device>,
    #[serde(with = "b64::opt", skip_serializing_if = "Option::is_none", default)]
    pub device_sig: Option<Vec<u8>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub revocation: Option<DeviceRevocation>,
}

impl WirePayload {
    /// A bare wire of the given kind with every optional field unset.
    pub fn new(kind: WireKind) -> Self {
        Self {
            kind,
            envelope: None,
            plain: None,
            padding: None,
            conversation_id: None,
            conversation_type: None,
            thread_id: None,
            event_id: None,
            event_type: None,
            membership_version: None,
            group_key_version: None,
            sender_device_id: None,
            card: None,
            receipt: None,
            device: None,
            device_sig: None,
            revocation: None,
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ─── Auth payload ────────────────────────────────────────────────────────────

/// The canonical object the active device signs.
///
/// Field order is fixed by declaration order; `serde_json` emits no
/// whitespace; optional fields are omitted when absent. `envelope` and
/// `plain` always appear (as `null` when unset) so the two content slots are
/// committed to by every signature.
#[derive(Serialize)]
struct AuthPayload<'a> {
    message_id: &'a Uuid,
    sender_id: &'a str,
    recipient: &'a str,
    kind: WireKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    membership_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_key_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_device_id: Option<&'a str>,
    envelope: &'a Option<serde_json::Value>,
    #[serde(with = "b64::opt")]
    plain: &'a Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    card: Option<&'a ContactCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<&'a Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revocation: Option<&'a DeviceRevocation>,
}

/// Serialize the bytes the active device signs for a wire.
///
/// `message_id`, `sender_id` and `recipient` come from the transport
/// context; everything else from the wire itself. The device and its
/// signature are deliberately excluded — they are the attestation, not the
/// attested content.
pub fn build_auth_payload(
    message_id: &Uuid,
    sender_id: &str,
    recipient: &str,
    wire: &WirePayload,
) -> CoreResult<Vec<u8>> {
    let payload = AuthPayload {
        message_id,
        sender_id,
        recipient,
        kind: wire.kind,
        conversation_id: wire.conversation_id.as_deref(),
        conversation_type: wire.conversation_type.as_deref(),
        thread_id: wire.thread_id.as_deref(),
        event_id: wire.event_id.as_deref(),
        event_type: wire.event_type.as_deref(),
        membership_version: wire.membership_version,
        group_key_version: wire.group_key_version,
        sender_device_id: wire.sender_device_id.as_deref(),
        envelope: &wire.envelope,
        plain: &wire.plain,
        card: wire.card.as_ref(),
        receipt: wire.receipt.as_ref(),
        revocation: wire.revocation.as_ref(),
    };
    serde_json::to_vec(&payload)
        .map_err(|e| CoreError::api(format!("auth payload serialization: {e}")))
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate the group-conversation shape of a wire payload.
///
/// Direct wires (empty or `direct` conversation type) always pass. Anything
/// else must be a well-formed group wire: `conversation_type = "group"`,
/// non-empty conversation ID, event ID and sender device ID,
/// `membership_version ≥ 1`, and — for `"message"` events —
/// `group_key_version ≥ 1`. Other event types must belong to the closed
/// enumeration supplied by the group module. Every failure is the single
/// stable sentinel [`CoreError::InvalidGroupWirePayload`].
pub fn validate_wire_payload(
    wire: &WirePayload,
    known_group_event_types: &[&str],
) -> CoreResult<()> {
    let conversation_type = wire.conversation_type.as_deref().unwrap_or("");
    if conversation_type.is_empty() || conversation_type == CONVERSATION_TYPE_DIRECT {
        return Ok(());
    }
    if conversation_type != CONVERSATION_TYPE_GROUP {
        return Err(CoreError::InvalidGroupWirePayload);
    }

    let has = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
    if !has(&wire.conversation_id) || !has(&wire.event_id) || !has(&wire.sender_device_id) {
        return Err(CoreError::InvalidGroupWirePayload);
    }
    if wire.membership_version.unwrap_or(0) < 1 {
        return Err(CoreError::InvalidGroupWirePayload);
    }

    match wire.event_type.as_deref() {
        Some(GROUP_EVENT_MESSAGE) => {
            if wire.group_key_version.unwrap_or(0) < 1 {
                return Err(CoreError::InvalidGroupWirePayload);
            }
        }
        Some(other) if known_group_event_types.contains(&other) => {}
        _ => return Err(CoreError::InvalidGroupWirePayload),
    }

    Ok(())
}
