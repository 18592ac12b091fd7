//! Seed lifecycle — mnemonic generation, deterministic key derivation, and
//! the sealed seed envelope.
//!
//! The account key is reproducible from (mnemonic, seed password) alone:
//! BIP-39 turns the pair into a 64-byte seed, and a domain-separated
//! BLAKE2b-256 of that seed becomes the Ed25519 signing-key secret. The
//! mnemonic itself is kept inside an Argon2id + ChaCha20-Poly1305 envelope
//! so it can be re-exported (consent-gated) without re-prompting at creation
//! time.

use bip39::{Language, Mnemonic};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use zeroize::Zeroize;

use aim_common::error::{CoreError, CoreResult};
use aim_common::passbox::{self, SealedBox};

use crate::keys::KeyPair;

type Blake2b256 = Blake2b<U32>;

/// Domain separator for signing-key derivation from the BIP-39 seed.
const KEY_DERIVATION_DOMAIN: &[u8] = b"aim identity signing key v1";

/// Entropy length for new mnemonics (16 bytes → 12 words).
const MNEMONIC_ENTROPY_LEN: usize = 16;

/// The sealed mnemonic as persisted inside the state envelope.
pub type SeedEnvelope = SealedBox;

/// Generate a fresh 12-word English mnemonic.
pub fn generate_mnemonic() -> CoreResult<Mnemonic> {
    let mut entropy = [0u8; MNEMONIC_ENTROPY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| CoreError::crypto(format!("mnemonic generation failed: {e}")))?;
    entropy.zeroize();
    Ok(mnemonic)
}

/// Parse and checksum-validate a mnemonic phrase.
pub fn parse_mnemonic(phrase: &str) -> CoreResult<Mnemonic> {
    Mnemonic::parse_in_normalized(Language::English, phrase.trim())
        .map_err(|e| CoreError::api(format!("invalid mnemonic: {e}")))
}

/// Whether a phrase is a well-formed BIP-39 mnemonic.
pub fn is_valid_mnemonic(phrase: &str) -> bool {
    parse_mnemonic(phrase).is_ok()
}

/// Derive the identity signing key pair from a mnemonic and seed password.
pub fn derive_identity_keypair(mnemonic: &Mnemonic, seed_password: &str) -> CoreResult<KeyPair> {
    let mut seed = mnemonic.to_seed_normalized(seed_password);
    let mut hasher = Blake2b256::new();
    hasher.update(KEY_DERIVATION_DOMAIN);
    hasher.update(seed);
    let digest = hasher.finalize();
    seed.zeroize();
    KeyPair::from_secret_bytes(&digest)
}

/// Seal the mnemonic phrase under the seed password.
pub fn seal_seed(mnemonic: &Mnemonic, seed_password: &str) -> CoreResult<SeedEnvelope> {
    passbox::seal(seed_password, mnemonic.to_string().as_bytes())
}

/// Open a seed envelope back into the mnemonic phrase.
pub fn open_seed(envelope: &SeedEnvelope, seed_password: &str) -> CoreResult<String> {
    let bytes = passbox::open(seed_password, envelope)?;
    String::from_utf8(bytes).map_err(|_| CoreError::crypto("seed envelope held non-utf8 phrase"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let mnemonic = generate_mnemonic().unwrap();
        let kp1 = derive_identity_keypair(&mnemonic, "pw").unwrap();
        let kp2 = derive_identity_keypair(&mnemonic, "pw").unwrap();
        assert_eq!(kp1.identity_id(), kp2.identity_id());
    }

    #[test]
    fn seed_password_changes_the_key() {
        let mnemonic = generate_mnemonic().unwrap();
        let kp1 = derive_identity_keypair(&mnemonic, "pw").unwrap();
        let kp2 = derive_identity_keypair(&mnemonic, "other").unwrap();
        assert_ne!(kp1.identity_id(), kp2.identity_id());
    }

    #[test]
    fn import_reproduces_identity() {
        let mnemonic = generate_mnemonic().unwrap();
        let phrase = mnemonic.to_string();
        let kp1 = derive_identity_keypair(&mnemonic, "pw").unwrap();
        let reparsed = parse_mnemonic(&phrase).unwrap();
        let kp2 = derive_identity_keypair(&reparsed, "pw").unwrap();
        assert_eq!(kp1.identity_id(), kp2.identity_id());
    }

    #[test]
    fn seed_envelope_round_trip() {
        let mnemonic = generate_mnemonic().unwrap();
        let envelope = seal_seed(&mnemonic, "pw").unwrap();
        assert_eq!(open_seed(&envelope, "pw").unwrap(), mnemonic.to_string());
        assert!(open_seed(&envelope, "wrong").is_err());
    }

    #[test]
    fn junk_phrase_is_rejected() {
        assert!(!is_valid_mnemonic("definitely not a mnemonic phrase"));
    }
}
