//! Passphrase-sealed AEAD box.
//!
//! The one primitive behind the seed envelope, the on-disk state envelope,
//! and the backup blob: Argon2id stretches the passphrase into a
//! ChaCha20-Poly1305 key; the salt is fresh per seal and the nonce fresh per
//! write.

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{CoreError, CoreResult};
use crate::models::b64;

/// Argon2id salt length in bytes.
const SALT_LEN: usize = 16;
/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;

/// A passphrase-sealed ciphertext with its KDF salt and nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "b64")]
    pub kdf_salt: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> CoreResult<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CoreError::crypto(format!("argon2 key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal `plaintext` under `passphrase` with a fresh salt and nonce.
pub fn seal(passphrase: &str, plaintext: &[u8]) -> CoreResult<SealedBox> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CoreError::crypto("aead seal failed"))?;
    key.zeroize();

    Ok(SealedBox { kdf_salt: salt, nonce, ciphertext })
}

/// Open a sealed box. A wrong passphrase surfaces as a `crypto` failure.
pub fn open(passphrase: &str, sealed: &SealedBox) -> CoreResult<Vec<u8>> {
    if sealed.nonce.len() != NONCE_LEN {
        return Err(CoreError::crypto("malformed sealed box nonce"));
    }
    let mut key = derive_key(passphrase, &sealed.kdf_salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
        .map_err(|_| CoreError::crypto("aead open failed (wrong passphrase?)"))?;
    key.zeroize();
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal("hunter2", b"secret state").unwrap();
        let opened = open("hunter2", &sealed).unwrap();
        assert_eq!(opened, b"secret state");
    }

    #[test]
    fn wrong_passphrase_fails() {
        let sealed = seal("hunter2", b"secret state").unwrap();
        assert!(open("hunter3", &sealed).is_err());
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let a = seal("p", b"x").unwrap();
        let b = seal("p", b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
