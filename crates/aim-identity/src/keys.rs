//! Ed25519 signing keys and identity-ID derivation.
//!
//! An identity ID is deterministic: `"aim1" || base58(blake2b-256(pub))`.
//! Anyone holding a public key can recompute the ID, which is what binds a
//! contact card's claimed ID to its key during verification.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::identity::IDENTITY_ID_PREFIX;

type Blake2b256 = Blake2b<U32>;

/// Byte length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Byte length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Derive the identity ID for an Ed25519 public key.
pub fn derive_identity_id(public_key: &[u8]) -> String {
    let digest = Blake2b256::digest(public_key);
    format!("{IDENTITY_ID_PREFIX}{}", bs58::encode(digest).into_string())
}

/// An Ed25519 signing key pair bound to an identity or a device.
///
/// The single source of truth for one signer. Private bytes leave this type
/// only through [`KeyPair::secret_bytes`] for envelope persistence.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a brand-new random key pair.
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Reconstruct a key pair from raw 32-byte secret bytes.
    pub fn from_secret_bytes(secret: &[u8]) -> CoreResult<Self> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| CoreError::crypto("signing key must be exactly 32 bytes"))?;
        Ok(Self { signing_key: SigningKey::from_bytes(&bytes) })
    }

    /// Return the 32-byte secret for persistence inside the state envelope.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key.verifying_key().as_bytes().to_vec()
    }

    /// The identity ID this key pair's public half derives to.
    pub fn identity_id(&self) -> String {
        derive_identity_id(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("identity_id", &self.identity_id()).finish()
    }
}

/// Verify an Ed25519 signature over `message`.
pub fn verify_signature(public_key: &[u8], signature: &[u8], message: &[u8]) -> CoreResult<()> {
    let pubkey: [u8; PUBLIC_KEY_LEN] = public_key
        .try_into()
        .map_err(|_| CoreError::crypto("public key must be exactly 32 bytes"))?;
    let verifying_key = VerifyingKey::from_bytes(&pubkey)
        .map_err(|_| CoreError::crypto("malformed ed25519 public key"))?;
    let sig: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CoreError::crypto("signature must be exactly 64 bytes"))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CoreError::crypto("signature verification failed"))
}
