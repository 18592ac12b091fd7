//! Backup export/restore orchestration.
//!
//! Export gathers identity, contacts, messages, pending rows and session
//! snapshots into one sealed blob; restore reproduces the account from it.
//! Both are gated on the literal consent token, and export additionally on a
//! non-empty password — the blob is only as strong as its passphrase.

use std::sync::Arc;

use chrono::Utc;

use aim_common::error::{CoreError, CoreResult};
use aim_common::policy::is_backup_consent_token_valid;
use aim_session::SessionState;
use aim_store::{backup, BackupDocument};

use crate::CoreContext;

/// The backup service.
pub struct Backups {
    ctx: Arc<CoreContext>,
}

impl Backups {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Export the account as a sealed, portable blob.
    pub fn export_backup(&self, consent_token: &str, password: &str) -> CoreResult<String> {
        if !is_backup_consent_token_valid(consent_token) {
            return Err(CoreError::ConsentRequired);
        }
        if password.trim().is_empty() {
            return Err(CoreError::BackupPasswordRequired);
        }

        let kernel = self.ctx.kernel.snapshot();
        let identity = kernel
            .identity
            .ok_or_else(|| CoreError::api("no identity configured"))?;
        let signing_private_key = kernel
            .signing_secret
            .ok_or_else(|| CoreError::api("no identity configured"))?;
        let seed_envelope = kernel
            .seed_envelope
            .ok_or_else(|| CoreError::api("no identity configured"))?;

        let store = self.ctx.store.snapshot();
        let sessions = serde_json::to_value(self.ctx.sessions.snapshot())
            .map_err(|e| CoreError::storage(format!("session serialization: {e}")))?;

        let document = BackupDocument {
            version: backup::BACKUP_VERSION,
            exported_at: Utc::now(),
            identity,
            signing_private_key,
            seed_envelope,
            contacts: kernel.contacts.into_values().collect(),
            messages: store.messages.messages,
            pending: store.pending.entries,
            sessions,
        };
        let blob = backup::encode_backup(&document, password)?;
        tracing::info!("exported account backup");
        Ok(blob)
    }

    /// Restore an account from a backup blob. Installs a fresh primary
    /// device — device keys never travel in backups.
    pub async fn restore_backup(
        &self,
        blob: &str,
        password: &str,
        consent_token: &str,
        display_name: &str,
        device_name: &str,
    ) -> CoreResult<()> {
        if !is_backup_consent_token_valid(consent_token) {
            return Err(CoreError::ConsentRequired);
        }
        let document = backup::decode_backup(blob, password)?;

        self.ctx.kernel.restore_from_backup(
            document.identity.clone(),
            &document.signing_private_key,
            document.seed_envelope,
            document.contacts,
            display_name,
            device_name,
        )?;

        self.ctx
            .sessions
            .rekey_from_identity_secret(&document.signing_private_key);
        let sessions: Vec<SessionState> = serde_json::from_value(document.sessions)
            .map_err(|e| CoreError::storage(format!("malformed session snapshot: {e}")))?;
        self.ctx.sessions.restore(sessions);

        self.ctx.store.restore(aim_store::StoreSnapshot {
            messages: aim_store::MessageLogSnapshot { messages: document.messages },
            pending: aim_store::PendingQueueSnapshot { entries: document.pending },
        });

        self.ctx.persister.checkpoint().await;
        tracing::info!(identity = %document.identity.id, "restored account from backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connected_pair, establish_sessions, TestNode};
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn consent_and_password_are_enforced() {
        let (alice, _bob, _transport) = connected_pair();
        let backups = Backups::new(alice.ctx.clone());

        let err = backups.export_backup("", "p").unwrap_err();
        assert_eq!(err.to_string(), "backup export requires explicit consent token");

        let err = backups
            .export_backup("I_UNDERSTAND_BACKUP_RISK", "")
            .unwrap_err();
        assert_eq!(err.to_string(), "backup password is required");

        let err = backups
            .restore_backup("blob", "p", "nope", "Alice", "laptop")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backup export requires explicit consent token");
    }

    #[tokio::test]
    async fn restore_reproduces_the_account() {
        let (alice, bob, _transport) = connected_pair();
        establish_sessions(&alice, &bob);
        let sent = alice.messaging.send_message(&bob.id, "kept").await.unwrap();
        let alice_id = alice.ctx.kernel.identity().unwrap().id;

        let backups = Backups::new(alice.ctx.clone());
        let blob = backups
            .export_backup("I_UNDERSTAND_BACKUP_RISK", "backup-pw")
            .unwrap();

        // Restore into a completely fresh daemon.
        let transport = MemoryTransport::new();
        let fresh = TestNode::new("Temp", &transport);
        let fresh_backups = Backups::new(fresh.ctx.clone());
        fresh_backups
            .restore_backup(&blob, "backup-pw", "I_UNDERSTAND_BACKUP_RISK", "Alice", "laptop")
            .await
            .unwrap();

        assert_eq!(fresh.ctx.kernel.identity().unwrap().id, alice_id);
        assert!(fresh.ctx.kernel.contact(&bob.id).unwrap().is_verified());
        assert_eq!(
            fresh.ctx.store.messages.get(&sent.id).unwrap().content,
            b"kept"
        );
        assert_eq!(fresh.ctx.store.pending.len(), 1);
        assert!(fresh.ctx.sessions.has_session(&bob.id));

        // The restored identity still signs valid cards.
        let card = fresh.ctx.kernel.self_contact_card().unwrap();
        aim_identity::verify_contact_card(&card).unwrap();
    }

    #[tokio::test]
    async fn wrong_backup_password_fails() {
        let (alice, _bob, _transport) = connected_pair();
        let backups = Backups::new(alice.ctx.clone());
        let blob = backups
            .export_backup("I_UNDERSTAND_BACKUP_RISK", "right")
            .unwrap();
        let err = backups
            .restore_backup(&blob, "wrong", "I_UNDERSTAND_BACKUP_RISK", "Alice", "laptop")
            .await
            .unwrap_err();
        assert_eq!(err.category(), aim_common::ErrorCategory::Crypto);
    }
}
