//! # aim-identity
//!
//! The identity/trust kernel: Ed25519 signing keys, seed lifecycle, contact
//! cards with pinned-key continuity, the device roster with one active
//! device, and inbound revocation application.

pub mod card;
pub mod kernel;
pub mod keys;
pub mod seed;

pub use card::{sign_contact_card, verify_contact_card};
pub use kernel::{IdentityKernel, KernelSnapshot};
pub use keys::{derive_identity_id, verify_signature, KeyPair};
