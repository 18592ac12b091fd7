//! The encrypted state envelope file.
//!
//! A single version-1 AEAD envelope holds `{signing_private_key,
//! seed_envelope, runtime_state}`, each field an opaque JSON blob. The
//! passphrase is stretched with Argon2id; the nonce is fresh on every write;
//! writes go through a temp file + rename so a crash never leaves a torn
//! envelope behind.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use aim_common::error::{CoreError, CoreResult};
use aim_common::passbox::{self, SealedBox};

/// On-disk envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// The plaintext document sealed inside the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub signing_private_key: serde_json::Value,
    pub seed_envelope: serde_json::Value,
    pub runtime_state: serde_json::Value,
}

/// The outer, unencrypted file shape.
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeFile {
    version: u32,
    #[serde(flatten)]
    sealed: SealedBox,
}

/// Seal and atomically write the state document to `path`.
pub fn write_envelope(path: &Path, passphrase: &str, document: &StateDocument) -> CoreResult<()> {
    let plaintext = serde_json::to_vec(document)
        .map_err(|e| CoreError::storage(format!("state serialization: {e}")))?;
    let sealed = passbox::seal(passphrase, &plaintext)?;
    let file = EnvelopeFile { version: ENVELOPE_VERSION, sealed };
    let bytes = serde_json::to_vec(&file)
        .map_err(|e| CoreError::storage(format!("envelope serialization: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::storage(format!("create state dir: {e}")))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes).map_err(|e| CoreError::storage(format!("write envelope: {e}")))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::storage(format!("commit envelope: {e}")))?;
    Ok(())
}

/// Read and open the state document from `path`.
pub fn read_envelope(path: &Path, passphrase: &str) -> CoreResult<StateDocument> {
    let bytes = fs::read(path).map_err(|e| CoreError::storage(format!("read envelope: {e}")))?;
    let file: EnvelopeFile = serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::storage(format!("malformed envelope: {e}")))?;
    if file.version != ENVELOPE_VERSION {
        return Err(CoreError::storage(format!(
            "unsupported envelope version {}",
            file.version
        )));
    }
    let plaintext = passbox::open(passphrase, &file.sealed)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::storage(format!("malformed state document: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> StateDocument {
        StateDocument {
            signing_private_key: serde_json::json!("c2VjcmV0"),
            seed_envelope: serde_json::json!({"kdf_salt": "", "nonce": "", "ciphertext": ""}),
            runtime_state: serde_json::json!({"contacts": []}),
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("aim-env-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.aim");
        write_envelope(&path, "pw", &document()).unwrap();

        let loaded = read_envelope(&path, "pw").unwrap();
        assert_eq!(loaded.signing_private_key, serde_json::json!("c2VjcmV0"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wrong_passphrase_is_a_crypto_error() {
        let dir = std::env::temp_dir().join(format!("aim-env-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.aim");
        write_envelope(&path, "pw", &document()).unwrap();

        let err = read_envelope(&path, "nope").unwrap_err();
        assert_eq!(err.category(), aim_common::ErrorCategory::Crypto);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn envelope_file_is_not_plaintext() {
        let dir = std::env::temp_dir().join(format!("aim-env-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.aim");
        write_envelope(&path, "pw", &document()).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"version\":1"));
        assert!(!raw.contains("contacts"));
        fs::remove_dir_all(&dir).ok();
    }
}
