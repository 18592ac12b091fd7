//! The identity kernel — single writer for identity, contacts, devices, and
//! revocations.
//!
//! All mutating operations take the exclusive lock; reads take the shared
//! lock. A snapshot is taken under the shared lock and is therefore a fully
//! self-consistent view of contacts, devices, the active-device pointer and
//! the revoked sets. Other subsystems observe device revocations only
//! through [`IdentityKernel::apply_device_revocation`]; nothing else reaches
//! into the roster.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::b64;
use aim_common::models::identity::{Contact, ContactCard, Device, DeviceRevocation, Identity};
use aim_common::policy::validate_contact_id;
use serde::{Deserialize, Serialize};

use crate::card::{sign_contact_card, verify_contact_card};
use crate::keys::{verify_signature, KeyPair};
use crate::seed::{
    self, derive_identity_keypair, generate_mnemonic, parse_mnemonic, SeedEnvelope,
};

/// A roster device together with its signing key pair.
#[derive(Debug, Clone)]
struct LocalDevice {
    device: Device,
    keys: KeyPair,
}

/// Serializable form of a roster device, used in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeviceSnapshot {
    pub device: Device,
    #[serde(with = "b64")]
    pub secret: Vec<u8>,
}

/// A fully self-consistent snapshot of kernel state, as persisted inside the
/// encrypted state envelope (`runtime_state`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub identity: Option<Identity>,
    #[serde(with = "b64::opt", default)]
    pub signing_secret: Option<Vec<u8>>,
    pub seed_envelope: Option<SeedEnvelope>,
    pub display_name: String,
    pub contacts: BTreeMap<String, Contact>,
    pub devices: Vec<LocalDeviceSnapshot>,
    pub active_device_id: Option<String>,
    /// Per-identity revoked device IDs (keyed by contact identity ID; the
    /// local identity's own revocations live under its own ID).
    pub revoked_devices: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct KernelState {
    identity: Option<Identity>,
    signing: Option<KeyPair>,
    seed_envelope: Option<SeedEnvelope>,
    display_name: String,
    contacts: BTreeMap<String, Contact>,
    devices: BTreeMap<String, LocalDevice>,
    active_device_id: Option<String>,
    revoked: BTreeMap<String, BTreeSet<String>>,
}

impl KernelState {
    fn signing(&self) -> CoreResult<&KeyPair> {
        self.signing
            .as_ref()
            .ok_or_else(|| CoreError::api("no identity configured"))
    }

    fn identity(&self) -> CoreResult<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| CoreError::api("no identity configured"))
    }

    fn install_identity(
        &mut self,
        keys: KeyPair,
        seed_envelope: SeedEnvelope,
        display_name: &str,
        device_name: &str,
    ) -> Identity {
        let identity = Identity {
            id: keys.identity_id(),
            public_key: keys.public_key_bytes(),
        };

        // A fresh identity starts from a clean slate.
        self.contacts.clear();
        self.devices.clear();
        self.revoked.clear();

        let device_keys = KeyPair::generate();
        let primary = LocalDevice {
            device: Device {
                id: Uuid::new_v4().to_string(),
                name: device_name.to_owned(),
                public_key: device_keys.public_key_bytes(),
                identity_id: identity.id.clone(),
                created_at: Utc::now(),
            },
            keys: device_keys,
        };
        self.active_device_id = Some(primary.device.id.clone());
        self.devices.insert(primary.device.id.clone(), primary);

        self.display_name = display_name.to_owned();
        self.seed_envelope = Some(seed_envelope);
        self.signing = Some(keys);
        self.identity = Some(identity.clone());
        identity
    }
}

/// Owner of the signing keypair, seed envelope, device roster, contacts map,
/// and revoked-devices set.
pub struct IdentityKernel {
    state: RwLock<KernelState>,
}

impl Default for IdentityKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityKernel {
    pub fn new() -> Self {
        Self { state: RwLock::new(KernelState::default()) }
    }

    // ─── Identity lifecycle ──────────────────────────────────────────────────

    /// Create a brand-new identity, returning it with the mnemonic to show
    /// the user exactly once.
    pub fn create_identity(
        &self,
        display_name: &str,
        seed_password: &str,
        device_name: &str,
    ) -> CoreResult<(Identity, String)> {
        let mnemonic = generate_mnemonic()?;
        let keys = derive_identity_keypair(&mnemonic, seed_password)?;
        let envelope = seed::seal_seed(&mnemonic, seed_password)?;

        let mut state = self.state.write();
        let identity = state.install_identity(keys, envelope, display_name, device_name);
        tracing::info!(identity = %identity.id, "created identity");
        Ok((identity, mnemonic.to_string()))
    }

    /// Import an identity from an existing mnemonic.
    pub fn import_identity(
        &self,
        display_name: &str,
        mnemonic_phrase: &str,
        seed_password: &str,
        device_name: &str,
    ) -> CoreResult<Identity> {
        let mnemonic = parse_mnemonic(mnemonic_phrase)?;
        let keys = derive_identity_keypair(&mnemonic, seed_password)?;
        let envelope = seed::seal_seed(&mnemonic, seed_password)?;

        let mut state = self.state.write();
        let identity = state.install_identity(keys, envelope, display_name, device_name);
        tracing::info!(identity = %identity.id, "imported identity");
        Ok(identity)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.read().identity.clone()
    }

    pub fn require_identity(&self) -> CoreResult<Identity> {
        self.state.read().identity().cloned()
    }

    /// Sign a fresh self contact card with the identity key.
    pub fn self_contact_card(&self) -> CoreResult<ContactCard> {
        let state = self.state.read();
        sign_contact_card(state.signing()?, &state.display_name)
    }

    /// Open the seed envelope and return the mnemonic phrase. Consent
    /// gating is the caller's job; this only checks the password.
    pub fn export_seed(&self, seed_password: &str) -> CoreResult<String> {
        let state = self.state.read();
        let envelope = state
            .seed_envelope
            .as_ref()
            .ok_or_else(|| CoreError::api("no identity configured"))?;
        seed::open_seed(envelope, seed_password)
    }

    /// Re-seal the seed envelope under a new password.
    pub fn change_seed_password(&self, old: &str, new: &str) -> CoreResult<()> {
        if new.trim().is_empty() {
            return Err(CoreError::api("new password is required"));
        }
        let mut state = self.state.write();
        let envelope = state
            .seed_envelope
            .as_ref()
            .ok_or_else(|| CoreError::api("no identity configured"))?;
        let phrase = seed::open_seed(envelope, old)?;
        let mnemonic = parse_mnemonic(&phrase)?;
        state.seed_envelope = Some(seed::seal_seed(&mnemonic, new)?);
        Ok(())
    }

    // ─── Contacts ────────────────────────────────────────────────────────────

    /// Verify a card and insert/update the contact, pinning its key.
    ///
    /// If the contact already carries a different non-empty pinned key, the
    /// card is rejected with [`CoreError::ContactKeyMismatch`].
    pub fn add_contact(&self, card: &ContactCard) -> CoreResult<Contact> {
        verify_contact_card(card)?;

        let mut state = self.state.write();
        if let Some(existing) = state.contacts.get_mut(&card.identity_id) {
            if existing.is_verified() && existing.public_key != card.public_key {
                return Err(CoreError::ContactKeyMismatch);
            }
            existing.display_name = card.display_name.clone();
            existing.public_key = card.public_key.clone();
            return Ok(existing.clone());
        }

        let contact = Contact {
            id: card.identity_id.clone(),
            display_name: card.display_name.clone(),
            public_key: card.public_key.clone(),
            added_at: Utc::now(),
            last_seen: None,
        };
        state.contacts.insert(contact.id.clone(), contact.clone());
        tracing::debug!(contact = %contact.id, "added contact from card");
        Ok(contact)
    }

    /// Lightweight add for ID-first flows: the public key stays empty (and
    /// the contact unverified) until a card arrives.
    pub fn add_contact_by_id(&self, contact_id: &str, display_name: &str) -> CoreResult<Contact> {
        let contact_id = validate_contact_id(contact_id)?;
        let mut state = self.state.write();
        if let Some(existing) = state.contacts.get(&contact_id) {
            return Ok(existing.clone());
        }
        let contact = Contact {
            id: contact_id.clone(),
            display_name: display_name.trim().to_owned(),
            public_key: Vec::new(),
            added_at: Utc::now(),
            last_seen: None,
        };
        state.contacts.insert(contact_id, contact.clone());
        Ok(contact)
    }

    pub fn has_contact(&self, contact_id: &str) -> bool {
        self.state.read().contacts.contains_key(contact_id)
    }

    pub fn contact(&self, contact_id: &str) -> Option<Contact> {
        self.state.read().contacts.get(contact_id).cloned()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state.read().contacts.values().cloned().collect()
    }

    pub fn remove_contact(&self, contact_id: &str) -> bool {
        self.state.write().contacts.remove(contact_id).is_some()
    }

    pub fn touch_contact(&self, contact_id: &str) {
        if let Some(contact) = self.state.write().contacts.get_mut(contact_id) {
            contact.last_seen = Some(Utc::now());
        }
    }

    // ─── Devices ─────────────────────────────────────────────────────────────

    /// Add a device to the local roster.
    pub fn add_device(&self, name: &str) -> CoreResult<Device> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::api("device name is required"));
        }
        let mut state = self.state.write();
        let identity_id = state.identity()?.id.clone();
        let keys = KeyPair::generate();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            public_key: keys.public_key_bytes(),
            identity_id,
            created_at: Utc::now(),
        };
        state
            .devices
            .insert(device.id.clone(), LocalDevice { device: device.clone(), keys });
        Ok(device)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.read().devices.values().map(|d| d.device.clone()).collect()
    }

    pub fn active_device(&self) -> CoreResult<Device> {
        let state = self.state.read();
        let id = state
            .active_device_id
            .as_ref()
            .ok_or_else(|| CoreError::api("no active device"))?;
        Ok(state.devices[id].device.clone())
    }

    /// Return the active device and its signature over `payload`.
    pub fn active_device_auth(&self, payload: &[u8]) -> CoreResult<(Device, Vec<u8>)> {
        let state = self.state.read();
        let id = state
            .active_device_id
            .as_ref()
            .ok_or_else(|| CoreError::api("no active device"))?;
        let local = &state.devices[id];
        Ok((local.device.clone(), local.keys.sign(payload)))
    }

    /// Verify an inbound wire's device signature and revocation status.
    pub fn verify_inbound_device(
        &self,
        contact_id: &str,
        device: &Device,
        payload: &[u8],
        signature: &[u8],
    ) -> CoreResult<()> {
        if device.identity_id != contact_id {
            return Err(CoreError::crypto("device does not belong to sender"));
        }
        verify_signature(&device.public_key, signature, payload)?;

        let state = self.state.read();
        if state
            .revoked
            .get(contact_id)
            .is_some_and(|set| set.contains(&device.id))
        {
            return Err(CoreError::crypto("device has been revoked"));
        }
        Ok(())
    }

    /// Remove one of our own devices from the roster and emit the signed
    /// revocation to broadcast. The local mutation is not rolled back if the
    /// broadcast later fails.
    pub fn revoke_own_device(&self, device_id: &str) -> CoreResult<DeviceRevocation> {
        let mut state = self.state.write();
        let identity_id = state.identity()?.id.clone();
        if state.active_device_id.as_deref() == Some(device_id) {
            return Err(CoreError::api("cannot revoke the active device"));
        }
        if state.devices.remove(device_id).is_none() {
            return Err(CoreError::not_found("device"));
        }

        let timestamp = Utc::now();
        let signing = state.signing()?;
        let signature = signing.sign(&aim_common::models::identity::revocation_signing_bytes(
            &identity_id,
            device_id,
            &timestamp,
        ));
        let revocation = DeviceRevocation {
            identity_id: identity_id.clone(),
            device_id: device_id.to_owned(),
            timestamp,
            signature,
        };
        state
            .revoked
            .entry(identity_id)
            .or_default()
            .insert(device_id.to_owned());
        tracing::info!(device = device_id, "revoked local device");
        Ok(revocation)
    }

    /// Apply a revocation received from a contact. Idempotent.
    ///
    /// When the contact's key is pinned, the revocation signature must
    /// verify against it; an unverified contact's revocation is applied on
    /// the wire's own authority (it can only ever shrink trust).
    pub fn apply_device_revocation(
        &self,
        contact_id: &str,
        revocation: &DeviceRevocation,
    ) -> CoreResult<()> {
        if revocation.identity_id != contact_id {
            return Err(CoreError::crypto("revocation does not belong to sender"));
        }
        if revocation.device_id.is_empty() {
            return Err(CoreError::api("revocation is missing a device id"));
        }

        let mut state = self.state.write();
        if let Some(contact) = state.contacts.get(contact_id) {
            if contact.is_verified() {
                verify_signature(
                    &contact.public_key,
                    &revocation.signature,
                    &revocation.signing_bytes(),
                )?;
            }
        }
        let inserted = state
            .revoked
            .entry(contact_id.to_owned())
            .or_default()
            .insert(revocation.device_id.clone());
        if inserted {
            tracing::info!(contact = contact_id, device = %revocation.device_id, "applied device revocation");
        }
        Ok(())
    }

    /// Rebuild the kernel from backup material.
    ///
    /// A backup deliberately carries no device roster (device keys never
    /// leave their device), so restore installs a fresh primary device.
    pub fn restore_from_backup(
        &self,
        identity: Identity,
        signing_secret: &[u8],
        seed_envelope: SeedEnvelope,
        contacts: Vec<Contact>,
        display_name: &str,
        device_name: &str,
    ) -> CoreResult<()> {
        let keys = KeyPair::from_secret_bytes(signing_secret)?;
        if keys.identity_id() != identity.id {
            return Err(CoreError::crypto("backup signing key does not match identity"));
        }
        let mut state = self.state.write();
        state.install_identity(keys, seed_envelope, display_name, device_name);
        state.contacts = contacts.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(())
    }

    // ─── Snapshot / restore ──────────────────────────────────────────────────

    /// Capture a self-consistent snapshot for the state envelope.
    pub fn snapshot(&self) -> KernelSnapshot {
        let state = self.state.read();
        KernelSnapshot {
            identity: state.identity.clone(),
            signing_secret: state.signing.as_ref().map(|k| k.secret_bytes().to_vec()),
            seed_envelope: state.seed_envelope.clone(),
            display_name: state.display_name.clone(),
            contacts: state.contacts.clone(),
            devices: state
                .devices
                .values()
                .map(|d| LocalDeviceSnapshot {
                    device: d.device.clone(),
                    secret: d.keys.secret_bytes().to_vec(),
                })
                .collect(),
            active_device_id: state.active_device_id.clone(),
            revoked_devices: state.revoked.clone(),
        }
    }

    /// Replace kernel state from a snapshot.
    pub fn restore(&self, snapshot: KernelSnapshot) -> CoreResult<()> {
        let signing = snapshot
            .signing_secret
            .as_deref()
            .map(KeyPair::from_secret_bytes)
            .transpose()?;
        let mut devices = BTreeMap::new();
        for entry in snapshot.devices {
            let keys = KeyPair::from_secret_bytes(&entry.secret)?;
            devices.insert(entry.device.id.clone(), LocalDevice { device: entry.device, keys });
        }
        if let Some(active) = &snapshot.active_device_id {
            if !devices.contains_key(active) {
                return Err(CoreError::storage("active device missing from snapshot"));
            }
        }

        let mut state = self.state.write();
        *state = KernelState {
            identity: snapshot.identity,
            signing,
            seed_envelope: snapshot.seed_envelope,
            display_name: snapshot.display_name,
            contacts: snapshot.contacts,
            devices,
            active_device_id: snapshot.active_device_id,
            revoked: snapshot.revoked_devices,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_with_identity() -> IdentityKernel {
        let kernel = IdentityKernel::new();
        kernel.create_identity("Alice", "pw", "laptop").unwrap();
        kernel
    }

    fn peer_card(name: &str) -> (KeyPair, ContactCard) {
        let kp = KeyPair::generate();
        let card = sign_contact_card(&kp, name).unwrap();
        (kp, card)
    }

    #[test]
    fn create_identity_installs_primary_active_device() {
        let kernel = kernel_with_identity();
        let active = kernel.active_device().unwrap();
        assert_eq!(active.name, "laptop");
        assert_eq!(kernel.devices().len(), 1);
        assert_eq!(active.identity_id, kernel.identity().unwrap().id);
    }

    #[test]
    fn forged_card_for_pinned_contact_is_rejected() {
        let kernel = kernel_with_identity();
        let (_, card) = peer_card("Bob");
        kernel.add_contact(&card).unwrap();

        // A card claiming Bob's ID but carrying another key fails the
        // id-to-key binding check before the pin is even consulted.
        let (other_kp, _) = peer_card("Bob");
        let mut forged = sign_contact_card(&other_kp, "Bob").unwrap();
        forged.identity_id = card.identity_id.clone();
        forged.signature = other_kp.sign(&forged.signing_bytes());
        assert!(kernel.add_contact(&forged).is_err());

        let contact = kernel.contact(&card.identity_id).unwrap();
        assert_eq!(contact.public_key, card.public_key);
    }

    #[test]
    fn re_adding_same_card_is_ok() {
        let kernel = kernel_with_identity();
        let (_, card) = peer_card("Bob");
        kernel.add_contact(&card).unwrap();
        kernel.add_contact(&card).unwrap();
        assert_eq!(kernel.contacts().len(), 1);
    }

    #[test]
    fn card_upgrade_pins_lightweight_contact() {
        let kernel = kernel_with_identity();
        let (kp, card) = peer_card("Bob");
        kernel
            .add_contact_by_id(&kp.identity_id(), "bob-by-id")
            .unwrap();
        assert!(!kernel.contact(&kp.identity_id()).unwrap().is_verified());

        kernel.add_contact(&card).unwrap();
        let contact = kernel.contact(&kp.identity_id()).unwrap();
        assert!(contact.is_verified());
        assert_eq!(contact.display_name, "Bob");
    }

    #[test]
    fn active_device_auth_round_trips() {
        let kernel = kernel_with_identity();
        let payload = b"auth payload bytes";
        let (device, sig) = kernel.active_device_auth(payload).unwrap();
        let self_id = kernel.identity().unwrap().id;
        kernel
            .verify_inbound_device(&self_id, &device, payload, &sig)
            .unwrap();
    }

    #[test]
    fn revoked_device_fails_inbound_verification() {
        let alice = kernel_with_identity();
        let bob = kernel_with_identity();
        let bob_id = bob.identity().unwrap().id;

        // Alice learns about Bob and one of his devices.
        let bob_card = bob.self_contact_card().unwrap();
        alice.add_contact(&bob_card).unwrap();
        let second = bob.add_device("tablet").unwrap();

        // Bob revokes the tablet; Alice applies the revocation.
        let revocation = bob.revoke_own_device(&second.id).unwrap();
        alice.apply_device_revocation(&bob_id, &revocation).unwrap();
        // Idempotent.
        alice.apply_device_revocation(&bob_id, &revocation).unwrap();

        let payload = b"wire";
        // A message signed by the revoked device key must now be rejected.
        let err = alice
            .verify_inbound_device(&bob_id, &second, payload, &[0u8; 64])
            .unwrap_err();
        assert_eq!(err.category(), aim_common::ErrorCategory::Crypto);
    }

    #[test]
    fn cannot_revoke_active_device() {
        let kernel = kernel_with_identity();
        let active = kernel.active_device().unwrap();
        assert!(kernel.revoke_own_device(&active.id).is_err());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let kernel = kernel_with_identity();
        let (_, card) = peer_card("Bob");
        kernel.add_contact(&card).unwrap();
        kernel.add_device("tablet").unwrap();

        let snapshot = kernel.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = IdentityKernel::new();
        restored
            .restore(serde_json::from_str(&json).unwrap())
            .unwrap();

        assert_eq!(restored.identity(), kernel.identity());
        assert_eq!(restored.contacts().len(), 1);
        assert_eq!(restored.devices().len(), 2);
        assert_eq!(
            restored.active_device().unwrap().id,
            kernel.active_device().unwrap().id
        );

        // The restored signing key still authenticates.
        let payload = b"post-restore";
        let (device, sig) = restored.active_device_auth(payload).unwrap();
        let self_id = restored.identity().unwrap().id;
        restored
            .verify_inbound_device(&self_id, &device, payload, &sig)
            .unwrap();
    }

    #[test]
    fn export_seed_requires_correct_password() {
        let kernel = IdentityKernel::new();
        let (_, mnemonic) = kernel.create_identity("Alice", "pw", "laptop").unwrap();
        assert_eq!(kernel.export_seed("pw").unwrap(), mnemonic);
        assert!(kernel.export_seed("wrong").is_err());
    }
}
