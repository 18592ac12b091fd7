//! Outbound wire construction.
//!
//! Every outgoing wire goes through the same tail: validate the payload,
//! build the canonical auth bytes, and attach the active device with its
//! signature. The head differs per kind — session ciphertext for `e2ee`,
//! plaintext plus our contact card for the handshake `plain` path, receipt
//! and revocation for control wires.

use rand::distributions::{Alphanumeric, DistString};
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::{DeviceRevocation, Message, Receipt};
use aim_common::wire::{build_auth_payload, validate_wire_payload, WireKind, WirePayload};

use crate::CoreContext;

/// Wire payload length bucket; padding rounds the content size up to this.
const PADDING_BUCKET: usize = 256;

/// Random padding so ciphertext length does not reveal message length.
fn length_padding(content_len: usize) -> Option<String> {
    let rem = content_len % PADDING_BUCKET;
    if rem == 0 {
        return None;
    }
    let mut rng = rand::thread_rng();
    Some(Alphanumeric.sample_string(&mut rng, PADDING_BUCKET - rem))
}

/// Validate, authenticate, and device-sign a wire for `recipient`.
pub fn seal_and_sign(
    ctx: &CoreContext,
    message_id: &Uuid,
    recipient_id: &str,
    mut wire: WirePayload,
) -> CoreResult<WirePayload> {
    validate_wire_payload(&wire, ctx.groups.known_event_types())?;
    let sender_id = ctx.kernel.require_identity()?.id;
    let auth = build_auth_payload(message_id, &sender_id, recipient_id, &wire)?;
    let (device, signature) = ctx.kernel.active_device_auth(&auth)?;
    wire.device = Some(device);
    wire.device_sig = Some(signature);
    Ok(wire)
}

/// Build the signed wire for an outbound message.
///
/// With a live session the content is ratcheted into an `e2ee` envelope;
/// without one this is the handshake path: a `plain` wire carrying our
/// contact card so the peer can verify us and establish trust.
pub fn build_message_wire(ctx: &CoreContext, message: &Message) -> CoreResult<WirePayload> {
    let mut wire;
    if ctx.sessions.has_session(&message.contact_id) {
        let envelope = ctx.sessions.encrypt(&message.contact_id, &message.content)?;
        wire = WirePayload::new(WireKind::E2ee);
        wire.envelope = Some(
            serde_json::to_value(&envelope)
                .map_err(|e| CoreError::crypto(format!("envelope serialization: {e}")))?,
        );
    } else {
        wire = WirePayload::new(WireKind::Plain);
        wire.plain = Some(message.content.clone());
        wire.card = Some(ctx.kernel.self_contact_card()?);
    }
    wire.thread_id = message.thread_id.clone();
    wire.padding = length_padding(message.content.len());
    seal_and_sign(ctx, &message.id, &message.contact_id, wire)
}

/// Build a signed receipt wire for a stored message.
pub fn build_receipt_wire(
    ctx: &CoreContext,
    wire_message_id: &Uuid,
    recipient_id: &str,
    receipt: Receipt,
) -> CoreResult<WirePayload> {
    let mut wire = WirePayload::new(WireKind::Receipt);
    wire.receipt = Some(receipt);
    seal_and_sign(ctx, wire_message_id, recipient_id, wire)
}

/// Build a signed device-revocation wire.
pub fn build_revocation_wire(
    ctx: &CoreContext,
    wire_message_id: &Uuid,
    recipient_id: &str,
    revocation: DeviceRevocation,
) -> CoreResult<WirePayload> {
    let mut wire = WirePayload::new(WireKind::DeviceRevoke);
    wire.revocation = Some(revocation);
    seal_and_sign(ctx, wire_message_id, recipient_id, wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_bucket() {
        let pad = length_padding(10).unwrap();
        assert_eq!(10 + pad.len(), PADDING_BUCKET);
        assert!(length_padding(PADDING_BUCKET).is_none());
        let pad = length_padding(PADDING_BUCKET + 1).unwrap();
        assert_eq!(pad.len(), PADDING_BUCKET - 1);
    }
}
