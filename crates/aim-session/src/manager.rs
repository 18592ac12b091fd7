//! Per-contact session management.
//!
//! Owns one [`SessionState`] per contact behind a per-contact lock; the
//! service layer treats every call here as atomic. The manager's base X25519
//! secret is derived once (outside this crate) from the identity seed, so a
//! restored identity re-derives the same session public key.

use std::collections::BTreeMap;
use std::sync::Arc;

use hkdf::Hkdf;
use parking_lot::{Mutex, RwLock};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use aim_common::error::{CoreError, CoreResult};

use crate::ratchet::{PublicSessionState, RatchetEnvelope, SessionState};

const INFO_SESSION_BASE: &[u8] = b"aim session base key v1";

/// Manages ratchet sessions for all contacts.
pub struct SessionManager {
    base_secret: RwLock<StaticSecret>,
    sessions: RwLock<BTreeMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    /// Build a manager around a 32-byte base secret.
    pub fn new(base_secret: [u8; 32]) -> Self {
        Self {
            base_secret: RwLock::new(StaticSecret::from(base_secret)),
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Derive the session base secret from the identity signing secret, so a
    /// restored identity re-derives the same session public key.
    pub fn from_identity_secret(identity_secret: &[u8]) -> Self {
        Self::new(derive_base_secret(identity_secret))
    }

    /// Swap the base secret (identity created/imported/restored at runtime).
    /// Existing sessions are dropped; peers must re-initialise.
    pub fn rekey_from_identity_secret(&self, identity_secret: &[u8]) {
        *self.base_secret.write() = StaticSecret::from(derive_base_secret(identity_secret));
        self.sessions.write().clear();
    }

    /// The session public key peers use to initialise a session with us.
    pub fn local_public_key(&self) -> Vec<u8> {
        PublicKey::from(&*self.base_secret.read()).as_bytes().to_vec()
    }

    /// Establish (or re-establish) a session with a contact.
    ///
    /// Re-initialising replaces any existing session state for the contact.
    pub fn init_session(
        &self,
        contact_id: &str,
        peer_public_key: &[u8],
    ) -> CoreResult<PublicSessionState> {
        let state =
            SessionState::establish(contact_id, &self.base_secret.read(), peer_public_key)?;
        let public = state.public_state();
        self.sessions
            .write()
            .insert(contact_id.to_owned(), Arc::new(Mutex::new(state)));
        tracing::debug!(contact = contact_id, session = %public.session_id, "session established");
        Ok(public)
    }

    pub fn has_session(&self, contact_id: &str) -> bool {
        self.sessions.read().contains_key(contact_id)
    }

    pub fn session_state(&self, contact_id: &str) -> Option<PublicSessionState> {
        let handle = self.sessions.read().get(contact_id).cloned()?;
        let state = handle.lock();
        Some(state.public_state())
    }

    fn session(&self, contact_id: &str) -> CoreResult<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .get(contact_id)
            .cloned()
            .ok_or_else(|| CoreError::crypto(format!("no session with {contact_id}")))
    }

    /// Encrypt plaintext for a contact, advancing the session.
    pub fn encrypt(&self, contact_id: &str, plaintext: &[u8]) -> CoreResult<RatchetEnvelope> {
        let handle = self.session(contact_id)?;
        let mut state = handle.lock();
        state.encrypt(plaintext)
    }

    /// Decrypt an inbound envelope from a contact.
    ///
    /// Ratchet steps run against a trial copy; a forged header or bad
    /// ciphertext must not be able to corrupt the live session state.
    pub fn decrypt(&self, contact_id: &str, envelope: &RatchetEnvelope) -> CoreResult<Vec<u8>> {
        let handle = self.session(contact_id)?;
        let mut state = handle.lock();
        let mut trial = state.clone();
        let plaintext = trial.decrypt(envelope)?;
        *state = trial;
        Ok(plaintext)
    }

    pub fn remove_session(&self, contact_id: &str) -> bool {
        self.sessions.write().remove(contact_id).is_some()
    }

    /// Snapshot every session for the state envelope.
    pub fn snapshot(&self) -> Vec<SessionState> {
        self.sessions
            .read()
            .values()
            .map(|handle| handle.lock().clone())
            .collect()
    }

    /// Replace all sessions from a snapshot.
    pub fn restore(&self, states: Vec<SessionState>) {
        let mut sessions = self.sessions.write();
        sessions.clear();
        for state in states {
            sessions.insert(state.contact_id.clone(), Arc::new(Mutex::new(state)));
        }
    }
}

fn derive_base_secret(identity_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, identity_secret);
    let mut okm = [0u8; 32];
    hk.expand(INFO_SESSION_BASE, &mut okm)
        .expect("hkdf output length is valid");
    okm
}
