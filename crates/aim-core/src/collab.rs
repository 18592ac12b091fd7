//! External-collaborator seams: privacy policy, group routing, message
//! requests, blob storage, and the persistence checkpoint hook.
//!
//! The core drives these by contract only. Each trait ships with a small
//! default implementation so a daemon can be composed without the optional
//! subsystem — the capability set tells the RPC layer what is actually
//! wired in.

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::models::Message;
use aim_common::wire::WirePayload;

/// Verdict from the privacy/blocklist collaborator for an inbound sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Reject,
    /// Route into the message-request flow.
    Queue,
}

/// Privacy policy consulted at the head of the inbound pipeline.
pub trait PrivacyPolicy: Send + Sync {
    fn decide(&self, sender_id: &str) -> PolicyDecision;

    /// Insert unknown senders as lightweight contacts instead of demanding a
    /// card (e.g. inside an already-accepted group).
    fn auto_add_unknown_senders(&self) -> bool {
        false
    }

    /// Skip device authentication (group plaintext path).
    fn bypass_device_auth(&self) -> bool {
        false
    }
}

/// Default policy: accept everyone, no shortcuts.
pub struct AcceptAllPolicy;

impl PrivacyPolicy for AcceptAllPolicy {
    fn decide(&self, _sender_id: &str) -> PolicyDecision {
        PolicyDecision::Accept
    }
}

/// Group-messaging collaborator. The core hands over any wire with
/// `conversation_type = "group"` and otherwise stays out of group business.
#[async_trait]
pub trait GroupRouter: Send + Sync {
    /// The closed enumeration of group event types the router understands.
    fn known_event_types(&self) -> &[&str];

    /// Route a group wire. `message` events carry member content; everything
    /// else is group orchestration.
    async fn route(&self, sender_id: &str, wire: &WirePayload) -> CoreResult<()>;
}

/// Router used when no group subsystem is composed in.
pub struct NoGroups;

#[async_trait]
impl GroupRouter for NoGroups {
    fn known_event_types(&self) -> &[&str] {
        &[]
    }

    async fn route(&self, _sender_id: &str, _wire: &WirePayload) -> CoreResult<()> {
        Err(CoreError::NotSupported { capability: "groups".into() })
    }
}

/// Storage for messages from senders the policy queued (message requests).
pub trait MessageRequestStore: Send + Sync {
    fn store(&self, message: Message);
    fn list(&self, sender_id: &str) -> Vec<Message>;
}

/// In-memory message-request store.
#[derive(Default)]
pub struct InMemoryMessageRequests {
    inner: Mutex<Vec<Message>>,
}

impl MessageRequestStore for InMemoryMessageRequests {
    fn store(&self, message: Message) {
        let mut inner = self.inner.lock();
        if inner.iter().any(|m| m.id == message.id) {
            return;
        }
        inner.push(message);
    }

    fn list(&self, sender_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .iter()
            .filter(|m| m.contact_id == sender_id)
            .cloned()
            .collect()
    }
}

/// Attachment blob persistence.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, mime: &str) -> CoreResult<Uuid>;
    async fn get(&self, id: &Uuid) -> CoreResult<Option<Vec<u8>>>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    inner: Mutex<std::collections::BTreeMap<Uuid, Vec<u8>>>,
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, _mime: &str) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().insert(id, bytes);
        Ok(id)
    }

    async fn get(&self, id: &Uuid) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().get(id).cloned())
    }
}

/// Persistence checkpoint hook.
///
/// Services call this after mutations that must survive a restart (message
/// and pending writes, trust changes). The daemon's implementation debounces
/// into state-envelope writes; the default forgets.
#[async_trait]
pub trait StatePersister: Send + Sync {
    async fn checkpoint(&self);
}

/// No-op persister for tests and ephemeral daemons.
pub struct NoPersistence;

#[async_trait]
impl StatePersister for NoPersistence {
    async fn checkpoint(&self) {}
}
