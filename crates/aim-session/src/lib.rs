//! # aim-session
//!
//! Per-contact Double-Ratchet sessions: X25519 ratchet steps, HKDF-SHA256
//! chain keys, ChaCha20-Poly1305 message sealing, and a bounded cache of
//! skipped message keys for out-of-order delivery. The core treats every
//! manager call as atomic; state leaves the process only as snapshots inside
//! the encrypted state envelope.

pub mod manager;
pub mod ratchet;

pub use manager::SessionManager;
pub use ratchet::{PublicSessionState, RatchetEnvelope, RatchetHeader, SessionState};
