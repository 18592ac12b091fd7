//! Identity, contact, and device models.
//!
//! An identity ID is `"aim1" || base58(blake2b-256(ed25519_pub))` — derived,
//! never chosen. A contact's public key, once set, is pinned: any later card
//! carrying a different key is a continuity violation and must be rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::b64;

/// Literal prefix of every identity ID.
pub const IDENTITY_ID_PREFIX: &str = "aim1";

/// Minimum plausible length of an identity ID (prefix + hash digits).
pub const IDENTITY_ID_MIN_LEN: usize = 12;

/// The local user's root identity.
///
/// Created once per account from a seed; never mutated thereafter. The
/// private half lives only in memory and inside the encrypted state envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Derived opaque ID (`aim1…`).
    pub id: String,
    /// Ed25519 public signing key.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// A peer identity known locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub display_name: String,
    /// Pinned Ed25519 public key. Empty until the first verified card
    /// arrives; immutable once non-empty.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    pub added_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Contact {
    /// A contact is verified once a card has pinned its public key.
    pub fn is_verified(&self) -> bool {
        !self.public_key.is_empty()
    }
}

/// Portable, self-signed identity assertion.
///
/// The signature covers `identity_id || 0 || display_name || 0 || public_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub identity_id: String,
    pub display_name: String,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl ContactCard {
    /// The exact byte string the card signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        card_signing_bytes(&self.identity_id, &self.display_name, &self.public_key)
    }
}

/// Byte concatenation signed by a contact card: `id || 0 || name || 0 || pub`.
pub fn card_signing_bytes(identity_id: &str, display_name: &str, public_key: &[u8]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(identity_id.len() + display_name.len() + public_key.len() + 2);
    buf.extend_from_slice(identity_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(display_name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(public_key);
    buf
}

/// An identity-scoped signing sub-key. The active device signs every
/// outgoing wire; only public material crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Per-device Ed25519 public key.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Parent identity ID.
    pub identity_id: String,
    pub created_at: DateTime<Utc>,
}

/// A signed statement that a device no longer speaks for an identity.
///
/// The signature is made by the identity key over
/// `identity_id || 0 || device_id || 0 || be64(timestamp_millis)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRevocation {
    pub identity_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl DeviceRevocation {
    /// The exact byte string the revocation signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        revocation_signing_bytes(&self.identity_id, &self.device_id, &self.timestamp)
    }
}

/// Byte concatenation signed by a device revocation.
pub fn revocation_signing_bytes(
    identity_id: &str,
    device_id: &str,
    timestamp: &DateTime<Utc>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(identity_id.len() + device_id.len() + 10);
    buf.extend_from_slice(identity_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(device_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_signing_bytes_are_separator_delimited() {
        let bytes = card_signing_bytes("aim1abc", "Alice", &[7u8; 4]);
        let mut want = b"aim1abc".to_vec();
        want.push(0);
        want.extend_from_slice(b"Alice");
        want.push(0);
        want.extend_from_slice(&[7u8; 4]);
        assert_eq!(bytes, want);
    }

    #[test]
    fn contact_without_key_is_unverified() {
        let contact = Contact {
            id: "aim1abc".into(),
            display_name: "Bob".into(),
            public_key: Vec::new(),
            added_at: Utc::now(),
            last_seen: None,
        };
        assert!(!contact.is_verified());
    }
}
