//! Contact-card signing and verification.
//!
//! A card is a portable, self-signed identity assertion. Verification is
//! three checks, in order: field sizes, ID-to-key binding (the identity ID
//! must be the deterministic hash of the embedded public key), and the
//! Ed25519 signature over the canonical signing tuple.

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::identity::{card_signing_bytes, ContactCard};

use crate::keys::{derive_identity_id, verify_signature, KeyPair, PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Sign a self contact card with the identity key pair.
pub fn sign_contact_card(kp: &KeyPair, display_name: &str) -> CoreResult<ContactCard> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(CoreError::api("display name is required"));
    }
    let identity_id = kp.identity_id();
    let public_key = kp.public_key_bytes();
    let signature = kp.sign(&card_signing_bytes(&identity_id, display_name, &public_key));
    Ok(ContactCard {
        identity_id,
        display_name: display_name.to_owned(),
        public_key,
        signature,
    })
}

/// Verify a contact card end to end.
pub fn verify_contact_card(card: &ContactCard) -> CoreResult<()> {
    if card.public_key.len() != PUBLIC_KEY_LEN {
        return Err(CoreError::crypto("contact card public key has wrong length"));
    }
    if card.signature.len() != SIGNATURE_LEN {
        return Err(CoreError::crypto("contact card signature has wrong length"));
    }
    if card.identity_id.is_empty() || card.display_name.is_empty() {
        return Err(CoreError::crypto("contact card is missing required fields"));
    }
    if derive_identity_id(&card.public_key) != card.identity_id {
        return Err(CoreError::crypto(
            "contact card identity id does not match its public key",
        ));
    }
    verify_signature(&card.public_key, &card.signature, &card.signing_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trip() {
        let kp = KeyPair::generate();
        let card = sign_contact_card(&kp, "Alice").unwrap();
        verify_contact_card(&card).expect("card should verify");
    }

    #[test]
    fn any_mutated_field_fails_verification() {
        let kp = KeyPair::generate();
        let card = sign_contact_card(&kp, "Alice").unwrap();

        let mut tampered = card.clone();
        tampered.display_name = "Mallory".into();
        assert!(verify_contact_card(&tampered).is_err());

        let mut tampered = card.clone();
        tampered.identity_id.push('x');
        assert!(verify_contact_card(&tampered).is_err());

        let mut tampered = card.clone();
        tampered.public_key[0] ^= 1;
        assert!(verify_contact_card(&tampered).is_err());

        let mut tampered = card;
        tampered.signature[0] ^= 1;
        assert!(verify_contact_card(&tampered).is_err());
    }

    #[test]
    fn foreign_key_with_claimed_id_fails_binding_check() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let mut card = sign_contact_card(&kp, "Alice").unwrap();
        // Swap in another key while keeping the claimed ID.
        card.public_key = other.public_key_bytes();
        card.signature = other.sign(&card.signing_bytes());
        assert!(verify_contact_card(&card).is_err());
    }
}
