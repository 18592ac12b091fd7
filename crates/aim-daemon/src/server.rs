//! Method dispatch — the daemon side of the RPC contract.
//!
//! Wire decode and framing belong to the external JSON-RPC plumbing; this
//! module takes an already-decoded `(method, params)` pair, gates it on the
//! published capability set, decodes named parameters, calls the owning
//! service, and maps errors onto the reserved per-method codes.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aim_common::error::CoreError;
use aim_common::models::ContactCard;
use aim_common::policy::is_backup_consent_token_valid;
use aim_core::backup::Backups;
use aim_core::collab::BlobStore;
use aim_core::outbound::Messaging;
use aim_core::revocation::Revocations;
use aim_core::uploads::Uploads;
use aim_core::CoreContext;

use crate::accounts::Accounts;
use crate::rpc::{self, Capabilities, RpcError, INVALID_PARAMS};

/// The composed daemon services behind the RPC surface.
pub struct Daemon {
    pub ctx: Arc<CoreContext>,
    pub messaging: Messaging,
    pub revocations: Revocations,
    pub backups: Backups,
    pub uploads: Arc<Uploads>,
    pub blobs: Arc<dyn BlobStore>,
    pub accounts: Arc<Accounts>,
    pub capabilities: Capabilities,
}

fn params_to<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("invalid params: {e}"),
    })
}

fn b64_field(value: &str, label: &str) -> Result<Vec<u8>, RpcError> {
    B64.decode(value.as_bytes()).map_err(|_| RpcError {
        code: INVALID_PARAMS,
        message: format!("invalid params: {label} is not valid base64"),
    })
}

fn ok<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("result serialization: {e}"),
    })
}

// ─── Parameter shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateIdentityParams {
    seed_password: String,
    #[serde(default = "default_display_name")]
    display_name: String,
    #[serde(default = "default_device_name")]
    device_name: String,
}

#[derive(Deserialize)]
struct ImportIdentityParams {
    mnemonic: String,
    seed_password: String,
    #[serde(default = "default_display_name")]
    display_name: String,
    #[serde(default = "default_device_name")]
    device_name: String,
}

fn default_display_name() -> String {
    "me".into()
}

fn default_device_name() -> String {
    "primary".into()
}

#[derive(Deserialize)]
struct SendParams {
    contact_id: String,
    content: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Deserialize)]
struct ListParams {
    contact_id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Deserialize)]
struct EditParams {
    contact_id: String,
    message_id: String,
    content: String,
}

#[derive(Deserialize)]
struct MessageRefParams {
    #[serde(default)]
    contact_id: Option<String>,
    message_id: String,
}

#[derive(Deserialize)]
struct ContactIdParams {
    contact_id: String,
}

#[derive(Deserialize)]
struct AddContactParams {
    card: ContactCard,
}

#[derive(Deserialize)]
struct AddContactByIdParams {
    contact_id: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Deserialize)]
struct InitSessionParams {
    contact_id: String,
    /// Peer session public key, base64.
    peer_public_key: String,
}

#[derive(Deserialize)]
struct AccountSwitchParams {
    account: String,
}

#[derive(Deserialize)]
struct DeviceAddParams {
    name: String,
}

#[derive(Deserialize)]
struct DeviceRevokeParams {
    device_id: String,
}

#[derive(Deserialize)]
struct BackupExportParams {
    consent_token: String,
    password: String,
}

#[derive(Deserialize)]
struct BackupRestoreParams {
    blob: String,
    password: String,
    consent_token: String,
    #[serde(default = "default_display_name")]
    display_name: String,
    #[serde(default = "default_device_name")]
    device_name: String,
}

#[derive(Deserialize)]
struct ConsentParams {
    consent_token: String,
}

#[derive(Deserialize)]
struct SeedExportParams {
    consent_token: String,
    seed_password: String,
}

#[derive(Deserialize)]
struct ChangePasswordParams {
    old_password: String,
    new_password: String,
}

#[derive(Deserialize)]
struct MnemonicParams {
    mnemonic: String,
}

#[derive(Deserialize)]
struct FilePutParams {
    mime: String,
    /// Attachment bytes, base64.
    bytes: String,
}

#[derive(Deserialize)]
struct UploadInitParams {
    mime: String,
}

#[derive(Deserialize)]
struct UploadChunkParams {
    upload_id: Uuid,
    /// Chunk bytes, base64.
    chunk: String,
}

#[derive(Deserialize)]
struct UploadRefParams {
    upload_id: Uuid,
}

#[derive(Deserialize)]
struct BlobRefParams {
    blob_id: Uuid,
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

impl Daemon {
    /// Dispatch one decoded RPC call.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        rpc::check_capability(self.capabilities, method)?;
        let map = |err: CoreError| rpc::map_error(method, &err);

        match method {
            "identity.get" => ok(self.ctx.kernel.identity()),
            "identity.create" => {
                let p: CreateIdentityParams = params_to(params)?;
                let (identity, mnemonic) = self
                    .ctx
                    .kernel
                    .create_identity(&p.display_name, &p.seed_password, &p.device_name)
                    .map_err(map)?;
                self.rekey_sessions();
                self.ctx.persister.checkpoint().await;
                ok(json!({ "identity": identity, "mnemonic": mnemonic }))
            }
            "identity.login" | "identity.import_seed" => {
                let p: ImportIdentityParams = params_to(params)?;
                let identity = self
                    .ctx
                    .kernel
                    .import_identity(&p.display_name, &p.mnemonic, &p.seed_password, &p.device_name)
                    .map_err(map)?;
                self.rekey_sessions();
                self.ctx.persister.checkpoint().await;
                ok(identity)
            }
            "identity.validate_mnemonic" => {
                let p: MnemonicParams = params_to(params)?;
                ok(json!({ "valid": aim_identity::seed::is_valid_mnemonic(&p.mnemonic) }))
            }
            "identity.export_seed" => {
                let p: SeedExportParams = params_to(params)?;
                if !is_backup_consent_token_valid(&p.consent_token) {
                    return Err(map(CoreError::ConsentRequired));
                }
                let mnemonic = self.ctx.kernel.export_seed(&p.seed_password).map_err(map)?;
                ok(json!({ "mnemonic": mnemonic }))
            }
            "identity.change_password" => {
                let p: ChangePasswordParams = params_to(params)?;
                self.ctx
                    .kernel
                    .change_seed_password(&p.old_password, &p.new_password)
                    .map_err(map)?;
                self.ctx.persister.checkpoint().await;
                ok(json!({ "changed": true }))
            }
            "identity.self_contact_card" => {
                ok(self.ctx.kernel.self_contact_card().map_err(map)?)
            }

            "contact.add" => {
                let p: AddContactParams = params_to(params)?;
                let contact = self.ctx.kernel.add_contact(&p.card).map_err(map)?;
                self.ctx.persister.checkpoint().await;
                ok(contact)
            }
            "contact.add_by_id" => {
                let p: AddContactByIdParams = params_to(params)?;
                let contact = self
                    .ctx
                    .kernel
                    .add_contact_by_id(&p.contact_id, &p.display_name)
                    .map_err(map)?;
                self.ctx.persister.checkpoint().await;
                ok(contact)
            }
            "contact.list" => ok(self.ctx.kernel.contacts()),
            "contact.remove" => {
                let p: ContactIdParams = params_to(params)?;
                let removed = self.ctx.kernel.remove_contact(&p.contact_id);
                self.ctx.sessions.remove_session(&p.contact_id);
                self.ctx.persister.checkpoint().await;
                ok(json!({ "removed": removed }))
            }
            "contact.verify" => {
                let p: ContactIdParams = params_to(params)?;
                let contact = self
                    .ctx
                    .kernel
                    .contact(&p.contact_id)
                    .ok_or_else(|| map(CoreError::not_found("contact")))?;
                ok(json!({ "verified": contact.is_verified() }))
            }

            "account.list" => ok(self.accounts.list()),
            "account.current" => ok(self.accounts.current()),
            "account.switch" => {
                let p: AccountSwitchParams = params_to(params)?;
                // The switch flushes and reloads through the persister, which
                // also rekeys the session manager from the loaded identity.
                ok(self.accounts.switch(&p.account).map_err(map)?)
            }

            "session.init" => {
                let p: InitSessionParams = params_to(params)?;
                let peer_key = b64_field(&p.peer_public_key, "peer_public_key")?;
                let state = self
                    .messaging
                    .init_session(&p.contact_id, &peer_key)
                    .map_err(map)?;
                self.ctx.persister.checkpoint().await;
                ok(state)
            }

            "message.send" | "message.thread.send" => {
                let p: SendParams = params_to(params)?;
                let message = match &p.thread_id {
                    Some(thread_id) => {
                        self.messaging
                            .send_message_in_thread(&p.contact_id, &p.content, thread_id)
                            .await
                    }
                    None if method == "message.thread.send" => {
                        Err(CoreError::api("thread id is required"))
                    }
                    None => self.messaging.send_message(&p.contact_id, &p.content).await,
                }
                .map_err(map)?;
                ok(message)
            }
            "message.list" | "message.thread.list" => {
                let p: ListParams = params_to(params)?;
                let messages = match &p.thread_id {
                    Some(thread_id) => {
                        self.messaging
                            .get_messages_by_thread(&p.contact_id, thread_id, p.limit, p.offset)
                            .await
                    }
                    None if method == "message.thread.list" => {
                        Err(CoreError::api("thread id is required"))
                    }
                    None => self.messaging.get_messages(&p.contact_id, p.limit, p.offset).await,
                }
                .map_err(map)?;
                ok(messages)
            }
            "message.status" => {
                let p: MessageRefParams = params_to(params)?;
                let status = self.messaging.get_message_status(&p.message_id).map_err(map)?;
                ok(json!({ "message_id": p.message_id, "status": status }))
            }
            "message.edit" => {
                let p: EditParams = params_to(params)?;
                ok(self
                    .messaging
                    .edit_message(&p.contact_id, &p.message_id, &p.content)
                    .await
                    .map_err(map)?)
            }
            "message.delete" => {
                let p: MessageRefParams = params_to(params)?;
                let contact_id = p
                    .contact_id
                    .ok_or_else(|| map(CoreError::api("contact id is required")))?;
                self.messaging
                    .delete_message(&contact_id, &p.message_id)
                    .await
                    .map_err(map)?;
                ok(json!({ "deleted": true }))
            }
            "message.clear" => {
                let p: ContactIdParams = params_to(params)?;
                let removed = self.messaging.clear_messages(&p.contact_id).await.map_err(map)?;
                ok(json!({ "removed": removed }))
            }

            "device.list" => ok(self.ctx.kernel.devices()),
            "device.add" => {
                let p: DeviceAddParams = params_to(params)?;
                let device = self.ctx.kernel.add_device(&p.name).map_err(map)?;
                self.ctx.persister.checkpoint().await;
                ok(device)
            }
            "device.revoke" => {
                let p: DeviceRevokeParams = params_to(params)?;
                let summary = self.revocations.revoke_device(&p.device_id).await.map_err(map)?;
                match summary.delivery_error {
                    Some(delivery) => Err(rpc::map_revocation_delivery(&delivery)),
                    None => ok(json!({
                        "revoked_device_id": summary.revocation.device_id,
                        "broadcast_to": summary.attempted,
                    })),
                }
            }

            "backup.export" => {
                let p: BackupExportParams = params_to(params)?;
                let blob = self
                    .backups
                    .export_backup(&p.consent_token, &p.password)
                    .map_err(map)?;
                ok(json!({ "blob": blob }))
            }
            "backup.restore" => {
                let p: BackupRestoreParams = params_to(params)?;
                self.backups
                    .restore_backup(
                        &p.blob,
                        &p.password,
                        &p.consent_token,
                        &p.display_name,
                        &p.device_name,
                    )
                    .await
                    .map_err(map)?;
                ok(json!({ "restored": true }))
            }
            "data.wipe" => {
                let p: ConsentParams = params_to(params)?;
                if !is_backup_consent_token_valid(&p.consent_token) {
                    return Err(map(CoreError::ConsentRequired));
                }
                self.ctx.store.restore(aim_store::StoreSnapshot::default());
                self.ctx.persister.checkpoint().await;
                ok(json!({ "wiped": true }))
            }

            "file.put" => {
                let p: FilePutParams = params_to(params)?;
                let bytes = b64_field(&p.bytes, "bytes")?;
                ok(self.uploads.put(&p.mime, bytes).await.map_err(map)?)
            }
            "file.upload.init" => {
                let p: UploadInitParams = params_to(params)?;
                ok(json!({ "upload_id": self.uploads.init(&p.mime) }))
            }
            "file.upload.chunk" => {
                let p: UploadChunkParams = params_to(params)?;
                let chunk = b64_field(&p.chunk, "chunk")?;
                ok(self.uploads.append_chunk(&p.upload_id, &chunk).map_err(map)?)
            }
            "file.upload.status" => {
                let p: UploadRefParams = params_to(params)?;
                ok(self.uploads.status(&p.upload_id).map_err(map)?)
            }
            "file.upload.commit" => {
                let p: UploadRefParams = params_to(params)?;
                ok(self.uploads.commit(&p.upload_id).await.map_err(map)?)
            }

            "blob.get" => {
                let p: BlobRefParams = params_to(params)?;
                let bytes = self.blobs.get(&p.blob_id).await.map_err(map)?;
                ok(json!({ "bytes": bytes.map(|b| B64.encode(b)) }))
            }
            "blob.put" => {
                let p: FilePutParams = params_to(params)?;
                let bytes = b64_field(&p.bytes, "bytes")?;
                let blob_id = self.blobs.put(bytes, &p.mime).await.map_err(map)?;
                ok(json!({ "blob_id": blob_id }))
            }

            // Known methods whose subsystem passed the capability gate but
            // that this composition does not serve locally.
            other => Err(RpcError {
                code: rpc::NOT_SUPPORTED,
                message: format!("method {other} is not supported by this daemon"),
            }),
        }
    }

    fn rekey_sessions(&self) {
        if let Some(secret) = self.ctx.kernel.snapshot().signing_secret {
            self.ctx.sessions.rekey_from_identity_secret(&secret);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::EnvelopePersister;
    use aim_core::collab::{InMemoryBlobStore, NoGroups};
    use aim_core::dispatch::DispatchQueue;
    use aim_core::notify::NotificationBus;
    use aim_core::transport::MemoryTransport;
    use aim_identity::IdentityKernel;
    use aim_session::SessionManager;
    use aim_store::Store;
    use std::path::PathBuf;

    fn temp_state_dir() -> PathBuf {
        std::env::temp_dir().join(format!("aimd-rpc-{}", Uuid::new_v4()))
    }

    fn daemon_in(state_dir: PathBuf) -> Daemon {
        let kernel = Arc::new(IdentityKernel::new());
        let sessions = Arc::new(SessionManager::from_identity_secret(&[0u8; 32]));
        let store = Arc::new(Store::new());
        let persister = EnvelopePersister::new(
            kernel.clone(),
            sessions.clone(),
            store.clone(),
            state_dir.join("primary.aim"),
            "test-pass".into(),
        );
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
        let ctx = Arc::new(CoreContext {
            kernel: kernel.clone(),
            sessions,
            store,
            bus: Arc::new(NotificationBus::default()),
            transport: MemoryTransport::new(),
            groups: Arc::new(NoGroups),
            persister: persister.clone(),
        });
        let queue = DispatchQueue::new();
        Daemon {
            messaging: Messaging::new(ctx.clone(), queue),
            revocations: Revocations::new(ctx.clone()),
            backups: Backups::new(ctx.clone()),
            uploads: Uploads::new(blobs.clone()),
            blobs,
            accounts: Arc::new(Accounts::new(state_dir, persister, kernel)),
            capabilities: Capabilities::all() - Capabilities::NODE - Capabilities::GROUPS,
            ctx,
        }
    }

    fn daemon() -> Daemon {
        daemon_in(temp_state_dir())
    }

    #[tokio::test]
    async fn identity_lifecycle_over_rpc() {
        let daemon = daemon();
        let created = daemon
            .dispatch("identity.create", json!({ "seed_password": "pw" }))
            .await
            .unwrap();
        let mnemonic = created["mnemonic"].as_str().unwrap().to_owned();
        let id = created["identity"]["id"].as_str().unwrap().to_owned();
        assert!(id.starts_with("aim1"));

        let valid = daemon
            .dispatch("identity.validate_mnemonic", json!({ "mnemonic": mnemonic }))
            .await
            .unwrap();
        assert_eq!(valid["valid"], true);

        let card = daemon.dispatch("identity.self_contact_card", json!({})).await.unwrap();
        assert_eq!(card["identity_id"], id.as_str());
    }

    #[tokio::test]
    async fn gated_methods_answer_not_supported() {
        let daemon = daemon();
        let err = daemon.dispatch("node.status", json!({})).await.unwrap_err();
        assert_eq!(err.code, rpc::NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn account_switch_loads_the_target_envelope() {
        let state_dir = temp_state_dir();
        let daemon = daemon_in(state_dir.clone());
        daemon
            .dispatch("identity.create", json!({ "seed_password": "pw" }))
            .await
            .unwrap();

        // A second account's envelope already sits in the state directory.
        let work_kernel = Arc::new(IdentityKernel::new());
        work_kernel.create_identity("Worker", "pw", "laptop").unwrap();
        let work_id = work_kernel.identity().unwrap().id.clone();
        let work_secret = work_kernel.snapshot().signing_secret.unwrap();
        let work = EnvelopePersister::new(
            work_kernel,
            Arc::new(SessionManager::from_identity_secret(&work_secret)),
            Arc::new(Store::new()),
            state_dir.join("work.aim"),
            "test-pass".into(),
        );
        work.flush_now().unwrap();

        let listed = daemon.dispatch("account.list", json!({})).await.unwrap();
        let names: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["primary", "work"]);

        let current = daemon.dispatch("account.current", json!({})).await.unwrap();
        assert_eq!(current["name"], "primary");

        let switched = daemon
            .dispatch("account.switch", json!({ "account": "work" }))
            .await
            .unwrap();
        assert_eq!(switched["name"], "work");
        assert_eq!(switched["identity"]["id"], work_id.as_str());
        assert_eq!(daemon.ctx.kernel.identity().unwrap().id, work_id);

        let err = daemon
            .dispatch("account.switch", json!({ "account": "missing" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32036);
        assert_eq!(err.message, "account not found");

        std::fs::remove_dir_all(&state_dir).ok();
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params() {
        let daemon = daemon();
        let err = daemon
            .dispatch("message.send", json!({ "contact_id": 42 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn edit_error_carries_reserved_code_and_message() {
        let daemon = daemon();
        daemon
            .dispatch("identity.create", json!({ "seed_password": "pw" }))
            .await
            .unwrap();
        let err = daemon
            .dispatch(
                "message.edit",
                json!({
                    "contact_id": "aim1abcdefgh",
                    "message_id": Uuid::new_v4(),
                    "content": "x"
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, -32043);
        assert_eq!(err.message, "message not found");
    }

    #[tokio::test]
    async fn consent_gate_guards_seed_export() {
        let daemon = daemon();
        daemon
            .dispatch("identity.create", json!({ "seed_password": "pw" }))
            .await
            .unwrap();
        let err = daemon
            .dispatch(
                "identity.export_seed",
                json!({ "consent_token": "", "seed_password": "pw" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, -32025);

        let exported = daemon
            .dispatch(
                "identity.export_seed",
                json!({ "consent_token": "I_UNDERSTAND_BACKUP_RISK", "seed_password": "pw" }),
            )
            .await
            .unwrap();
        assert!(exported["mnemonic"].as_str().unwrap().split(' ').count() >= 12);
    }
}
