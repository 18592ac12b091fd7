//! Device-revocation fan-out.
//!
//! Revoking a device mutates the identity kernel first, then broadcasts a
//! signed `device_revoke` wire to every contact. Broadcast failures are
//! collected per recipient and surfaced as one aggregate error with a
//! partial/full distinction; even a total broadcast failure does not roll
//! back the local revocation.

use std::sync::Arc;

use uuid::Uuid;

use aim_common::error::{record_error, CoreError, CoreResult, ErrorCategory};
use aim_common::models::DeviceRevocation;
use aim_common::notify::METHOD_DEVICE_UPDATED;

use crate::transport::PrivateMessage;
use crate::wiring::build_revocation_wire;
use crate::CoreContext;

/// One contact the revocation did not reach.
#[derive(Debug, Clone)]
pub struct RevocationFailure {
    pub contact_id: String,
    pub category: ErrorCategory,
    pub error: String,
}

/// Aggregate broadcast failure for a device revocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("device revocation reached {}/{attempted} contacts", attempted - failed)]
pub struct DeviceRevocationDeliveryError {
    pub attempted: usize,
    pub failed: usize,
    pub failures: Vec<RevocationFailure>,
}

impl DeviceRevocationDeliveryError {
    /// True iff every attempted recipient failed (and there was at least one).
    pub fn is_full_failure(&self) -> bool {
        self.failed == self.attempted && self.attempted > 0
    }
}

/// Result of a revocation: the local mutation always succeeded; delivery
/// may not have.
#[derive(Debug)]
pub struct RevocationSummary {
    pub revocation: DeviceRevocation,
    pub attempted: usize,
    pub delivery_error: Option<DeviceRevocationDeliveryError>,
}

/// The revocation service.
pub struct Revocations {
    ctx: Arc<CoreContext>,
}

impl Revocations {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Revoke one of our devices and fan the signed revocation out to every
    /// contact.
    pub async fn revoke_device(&self, device_id: &str) -> CoreResult<RevocationSummary> {
        // Local mutation first; it is never rolled back by broadcast failure.
        let revocation = self.ctx.kernel.revoke_own_device(device_id)?;
        self.ctx.bus.publish(
            METHOD_DEVICE_UPDATED,
            serde_json::json!({ "revoked_device_id": device_id }),
        );
        self.ctx.persister.checkpoint().await;

        let sender_id = self.ctx.kernel.require_identity()?.id;
        let contacts = self.ctx.kernel.contacts();
        let attempted = contacts.len();
        let mut failures = Vec::new();

        for contact in contacts {
            if let Err(err) = self.publish_to(&sender_id, &contact.id, &revocation).await {
                record_error(err.category(), &err);
                failures.push(RevocationFailure {
                    contact_id: contact.id,
                    category: err.category(),
                    error: err.to_string(),
                });
            }
        }

        let delivery_error = if failures.is_empty() {
            None
        } else {
            Some(DeviceRevocationDeliveryError {
                attempted,
                failed: failures.len(),
                failures,
            })
        };
        if let Some(err) = &delivery_error {
            tracing::warn!(
                attempted = err.attempted,
                failed = err.failed,
                full = err.is_full_failure(),
                "revocation broadcast incomplete"
            );
        }

        Ok(RevocationSummary { revocation, attempted, delivery_error })
    }

    async fn publish_to(
        &self,
        sender_id: &str,
        contact_id: &str,
        revocation: &DeviceRevocation,
    ) -> CoreResult<()> {
        let wire_id = Uuid::new_v4();
        let wire = build_revocation_wire(&self.ctx, &wire_id, contact_id, revocation.clone())?;
        let payload = wire
            .encode()
            .map_err(|e| CoreError::api(format!("wire serialization: {e}")))?;
        self.ctx
            .transport
            .publish_private(PrivateMessage {
                id: wire_id,
                sender_id: sender_id.to_owned(),
                recipient_id: contact_id.to_owned(),
                payload,
            })
            .await
    }
}
