//! The Double-Ratchet state machine for one contact.
//!
//! Both sides derive the initial root from an X25519 agreement between their
//! session base keys; the two initial chain keys are assigned by public-key
//! order so the derivation is symmetric. From then on the ratchet follows
//! the usual dance: a sender rotates its DH key pair on the first encrypt
//! after having heard from the peer, and a receiver steps the root when a
//! header advertises a new remote public key. Message keys are single-use
//! ChaCha20-Poly1305 keys pulled off per-direction hash chains; a bounded
//! cache of skipped message keys absorbs out-of-order delivery.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::b64;

/// Maximum number of message keys skipped within one chain step.
const MAX_SKIP: u32 = 1000;
/// Cap on the total skipped-key cache per session.
const MAX_SKIPPED_CACHE: usize = 2000;

const INFO_ROOT_INIT: &[u8] = b"aim session root v1";
const INFO_ROOT_STEP: &[u8] = b"aim ratchet root v1";
const INFO_CHAIN_NEXT: &[u8] = b"aim chain key v1";
const INFO_MESSAGE_KEY: &[u8] = b"aim message key v1";

/// Ratchet header carried with every ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH public key.
    #[serde(with = "b64")]
    pub dh_public: Vec<u8>,
    /// Length of the sender's previous sending chain.
    pub prev_chain_len: u32,
    /// Index of this message in the current sending chain.
    pub counter: u32,
}

impl RatchetHeader {
    /// Canonical bytes bound into the AEAD as associated data.
    fn aad(&self) -> Vec<u8> {
        let mut buf = self.dh_public.clone();
        buf.extend_from_slice(&self.prev_chain_len.to_be_bytes());
        buf.extend_from_slice(&self.counter.to_be_bytes());
        buf
    }
}

/// The opaque ciphertext object placed into a wire's `envelope` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetEnvelope {
    pub header: RatchetHeader,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Full per-contact ratchet state. Serialized (inside the encrypted state
/// envelope) for snapshot/restore; never leaves the process otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub contact_id: String,

    #[serde(with = "b64")]
    dh_self_secret: Vec<u8>,
    #[serde(with = "b64")]
    dh_self_public: Vec<u8>,
    #[serde(with = "b64")]
    dh_remote: Vec<u8>,

    #[serde(with = "b64")]
    root_key: Vec<u8>,
    #[serde(with = "b64")]
    send_chain: Vec<u8>,
    #[serde(with = "b64")]
    recv_chain: Vec<u8>,

    send_count: u32,
    recv_count: u32,
    prev_send_count: u32,

    /// Rotate our DH key pair on the next encrypt (set after each decrypt).
    ratchet_due: bool,

    /// Skipped message keys: `"<b64 remote pub>:<n>"` → message key.
    skipped: BTreeMap<String, Vec<u8>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Key-material-free view of a session, safe to hand to RPC callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicSessionState {
    pub session_id: String,
    pub contact_id: String,
    pub send_count: u32,
    pub recv_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── KDF helpers ─────────────────────────────────────────────────────────────

fn hkdf_expand(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out).expect("hkdf output length is valid");
}

/// Step the root key with a fresh DH output: `(root, chain)`.
fn kdf_root(root: &[u8], dh_out: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut okm = [0u8; 64];
    hkdf_expand(Some(root), dh_out, INFO_ROOT_STEP, &mut okm);
    let out = (okm[..32].to_vec(), okm[32..].to_vec());
    okm.zeroize();
    out
}

/// Step a chain key: `(next_chain, message_key‖nonce)`.
fn kdf_chain(chain: &[u8]) -> (Vec<u8>, [u8; 44]) {
    let mut next = [0u8; 32];
    hkdf_expand(None, chain, INFO_CHAIN_NEXT, &mut next);
    let mut material = [0u8; 44];
    hkdf_expand(None, chain, INFO_MESSAGE_KEY, &mut material);
    (next.to_vec(), material)
}

fn seal(material: &[u8; 44], plaintext: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&material[..32]));
    cipher
        .encrypt(Nonce::from_slice(&material[32..]), Payload { msg: plaintext, aad })
        .map_err(|_| CoreError::crypto("ratchet seal failed"))
}

fn open(material: &[u8; 44], ciphertext: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&material[..32]));
    cipher
        .decrypt(Nonce::from_slice(&material[32..]), Payload { msg: ciphertext, aad })
        .map_err(|_| CoreError::crypto("ratchet open failed"))
}

fn secret_from(bytes: &[u8]) -> CoreResult<StaticSecret> {
    let arr: [u8; 32] =
        bytes.try_into().map_err(|_| CoreError::crypto("x25519 secret must be 32 bytes"))?;
    Ok(StaticSecret::from(arr))
}

fn public_from(bytes: &[u8]) -> CoreResult<PublicKey> {
    let arr: [u8; 32] =
        bytes.try_into().map_err(|_| CoreError::crypto("x25519 public key must be 32 bytes"))?;
    Ok(PublicKey::from(arr))
}

fn skipped_key(remote_pub: &[u8], n: u32) -> String {
    format!("{}:{n}", B64.encode(remote_pub))
}

// ─── Session state ───────────────────────────────────────────────────────────

impl SessionState {
    /// Establish a session from our base secret and the peer's base public.
    ///
    /// Symmetric: both sides compute the same root, and chain assignment
    /// goes by public-key order, so my send chain is the peer's recv chain.
    pub fn establish(
        contact_id: &str,
        base_secret: &StaticSecret,
        peer_public: &[u8],
    ) -> CoreResult<Self> {
        let peer = public_from(peer_public)?;
        let self_public = PublicKey::from(base_secret).as_bytes().to_vec();
        let shared = base_secret.diffie_hellman(&peer);

        // Symmetric salt: the two publics in lexicographic order.
        let (lo, hi) = if self_public.as_slice() <= peer_public {
            (self_public.as_slice(), peer_public)
        } else {
            (peer_public, self_public.as_slice())
        };
        let mut salt = lo.to_vec();
        salt.extend_from_slice(hi);

        let mut okm = [0u8; 96];
        hkdf_expand(Some(&salt), shared.as_bytes(), INFO_ROOT_INIT, &mut okm);
        let root_key = okm[..32].to_vec();
        let chain_lo = okm[32..64].to_vec();
        let chain_hi = okm[64..].to_vec();
        okm.zeroize();

        // The lexicographically lower public key sends on `chain_lo`.
        let (send_chain, recv_chain) = if self_public.as_slice() <= peer_public {
            (chain_lo, chain_hi)
        } else {
            (chain_hi, chain_lo)
        };

        let now = Utc::now();
        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact_id.to_owned(),
            dh_self_secret: base_secret.to_bytes().to_vec(),
            dh_self_public: self_public,
            dh_remote: peer_public.to_vec(),
            root_key,
            send_chain,
            recv_chain,
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            ratchet_due: false,
            skipped: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CoreResult<RatchetEnvelope> {
        if self.ratchet_due {
            self.rotate_sending_key()?;
        }

        let (next_chain, material) = kdf_chain(&self.send_chain);
        let header = RatchetHeader {
            dh_public: self.dh_self_public.clone(),
            prev_chain_len: self.prev_send_count,
            counter: self.send_count,
        };
        let ciphertext = seal(&material, plaintext, &header.aad())?;

        self.send_chain = next_chain;
        self.send_count += 1;
        self.updated_at = Utc::now();
        Ok(RatchetEnvelope { header, ciphertext })
    }

    /// Decrypt one envelope, stepping the receiving ratchet as needed.
    pub fn decrypt(&mut self, envelope: &RatchetEnvelope) -> CoreResult<Vec<u8>> {
        let header = &envelope.header;
        let aad = header.aad();

        // Out-of-order message from an already-passed chain position.
        let cache_key = skipped_key(&header.dh_public, header.counter);
        if let Some(material) = self.skipped.remove(&cache_key) {
            let arr: [u8; 44] = material
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::crypto("corrupt skipped key"))?;
            let plaintext = open(&arr, &envelope.ciphertext, &aad)?;
            self.updated_at = Utc::now();
            return Ok(plaintext);
        }

        if header.dh_public != self.dh_remote {
            // Peer rotated: close out the old chain, then step the root.
            self.skip_recv_keys(header.prev_chain_len)?;
            let secret = secret_from(&self.dh_self_secret)?;
            let remote = public_from(&header.dh_public)?;
            let dh_out = secret.diffie_hellman(&remote);
            let (root, recv_chain) = kdf_root(&self.root_key, dh_out.as_bytes());
            self.root_key = root;
            self.recv_chain = recv_chain;
            self.recv_count = 0;
            self.dh_remote = header.dh_public.clone();
        }

        self.skip_recv_keys(header.counter)?;
        let (next_chain, material) = kdf_chain(&self.recv_chain);
        let plaintext = open(&material, &envelope.ciphertext, &aad)?;

        self.recv_chain = next_chain;
        self.recv_count += 1;
        self.ratchet_due = true;
        self.updated_at = Utc::now();
        Ok(plaintext)
    }

    /// Rotate our DH key pair and derive a fresh sending chain.
    fn rotate_sending_key(&mut self) -> CoreResult<()> {
        let fresh = StaticSecret::random_from_rng(OsRng);
        let remote = public_from(&self.dh_remote)?;
        let dh_out = fresh.diffie_hellman(&remote);
        let (root, send_chain) = kdf_root(&self.root_key, dh_out.as_bytes());

        self.root_key = root;
        self.send_chain = send_chain;
        self.prev_send_count = self.send_count;
        self.send_count = 0;
        self.dh_self_public = PublicKey::from(&fresh).as_bytes().to_vec();
        self.dh_self_secret = fresh.to_bytes().to_vec();
        self.ratchet_due = false;
        Ok(())
    }

    /// Advance the receiving chain to `until`, caching skipped message keys.
    fn skip_recv_keys(&mut self, until: u32) -> CoreResult<()> {
        if until > self.recv_count + MAX_SKIP {
            return Err(CoreError::crypto("too many skipped messages"));
        }
        while self.recv_count < until {
            let (next_chain, material) = kdf_chain(&self.recv_chain);
            self.skipped
                .insert(skipped_key(&self.dh_remote, self.recv_count), material.to_vec());
            self.recv_chain = next_chain;
            self.recv_count += 1;
        }
        // Bound the cache; oldest entries go first.
        while self.skipped.len() > MAX_SKIPPED_CACHE {
            let oldest = self.skipped.keys().next().cloned();
            if let Some(key) = oldest {
                self.skipped.remove(&key);
            }
        }
        Ok(())
    }

    /// Key-material-free projection for RPC callers.
    pub fn public_state(&self) -> PublicSessionState {
        PublicSessionState {
            session_id: self.session_id.clone(),
            contact_id: self.contact_id.clone(),
            send_count: self.send_count,
            recv_count: self.recv_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
