//! Backup blob encode/decode.
//!
//! A backup is `base64(AEAD(json(document), passphrase))` where the AEAD
//! parameters ride along inside the sealed JSON. Consent-token and password
//! gating happen at the service layer; this module is purely mechanical.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::b64;
use aim_common::models::{Contact, Identity, Message, PendingMessage};
use aim_common::passbox::{self, SealedBox};

/// Backup format version.
pub const BACKUP_VERSION: u32 = 1;

/// Everything a restore needs to reproduce an account.
///
/// Sessions are carried as the session layer's own serialized states; the
/// store treats them as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub identity: Identity,
    #[serde(with = "b64")]
    pub signing_private_key: Vec<u8>,
    pub seed_envelope: SealedBox,
    pub contacts: Vec<Contact>,
    pub messages: Vec<Message>,
    pub pending: Vec<PendingMessage>,
    pub sessions: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct BackupBlob {
    version: u32,
    #[serde(flatten)]
    sealed: SealedBox,
}

/// Seal a backup document into a portable base64 blob.
pub fn encode_backup(document: &BackupDocument, password: &str) -> CoreResult<String> {
    let plaintext = serde_json::to_vec(document)
        .map_err(|e| CoreError::storage(format!("backup serialization: {e}")))?;
    let sealed = passbox::seal(password, &plaintext)?;
    let blob = BackupBlob { version: BACKUP_VERSION, sealed };
    let bytes = serde_json::to_vec(&blob)
        .map_err(|e| CoreError::storage(format!("backup blob serialization: {e}")))?;
    Ok(B64.encode(bytes))
}

/// Open a base64 backup blob back into its document.
pub fn decode_backup(blob: &str, password: &str) -> CoreResult<BackupDocument> {
    let bytes = B64
        .decode(blob.trim().as_bytes())
        .map_err(|_| CoreError::api("backup blob is not valid base64"))?;
    let blob: BackupBlob = serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::api(format!("malformed backup blob: {e}")))?;
    if blob.version != BACKUP_VERSION {
        return Err(CoreError::api(format!(
            "unsupported backup version {}",
            blob.version
        )));
    }
    let plaintext = passbox::open(password, &blob.sealed)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::storage(format!("malformed backup document: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> BackupDocument {
        BackupDocument {
            version: BACKUP_VERSION,
            exported_at: Utc::now(),
            identity: Identity { id: "aim1alice000".into(), public_key: vec![1; 32] },
            signing_private_key: vec![2; 32],
            seed_envelope: passbox::seal("seed-pw", b"phrase").unwrap(),
            contacts: Vec::new(),
            messages: Vec::new(),
            pending: Vec::new(),
            sessions: serde_json::json!([]),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let doc = document();
        let blob = encode_backup(&doc, "backup-pw").unwrap();
        let decoded = decode_backup(&blob, "backup-pw").unwrap();
        assert_eq!(decoded.identity, doc.identity);
        assert_eq!(decoded.signing_private_key, doc.signing_private_key);
    }

    #[test]
    fn wrong_password_fails() {
        let blob = encode_backup(&document(), "backup-pw").unwrap();
        assert!(decode_backup(&blob, "other").is_err());
    }

    #[test]
    fn junk_blob_is_an_api_error() {
        let err = decode_backup("@@not-base64@@", "pw").unwrap_err();
        assert_eq!(err.category(), aim_common::ErrorCategory::Api);
    }
}
