//! The anonymous-transport seam.
//!
//! The transport node is an external collaborator: it moves opaque
//! per-recipient messages and tells us nothing about who carried them. The
//! core only needs publish and a subscription stream. [`MemoryTransport`]
//! is the in-process implementation used by tests and by a daemon running
//! without a network node attached.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};

/// One opaque message addressed to a single recipient.
#[derive(Debug, Clone)]
pub struct PrivateMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    /// Serialized wire payload; the transport never looks inside.
    pub payload: Vec<u8>,
}

/// The anonymous transport seam: publish plus per-recipient subscription.
#[async_trait]
pub trait TransportNode: Send + Sync {
    /// Publish one private message to its recipient's subscription.
    async fn publish_private(&self, message: PrivateMessage) -> CoreResult<()>;

    /// Open the subscription stream for a recipient identity. Messages on
    /// the stream arrive serialized per sender.
    fn subscribe(&self, recipient_id: &str) -> mpsc::UnboundedReceiver<PrivateMessage>;
}

/// An in-process transport: messages published for a recipient land on that
/// recipient's local subscription channel.
#[derive(Default)]
pub struct MemoryTransport {
    subscribers: Mutex<BTreeMap<String, mpsc::UnboundedSender<PrivateMessage>>>,
    /// When set, publishes to these recipients fail with a network error.
    unreachable: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate a recipient the network cannot currently reach.
    pub fn set_unreachable(&self, recipient_id: &str, unreachable: bool) {
        let mut list = self.unreachable.lock();
        if unreachable {
            if !list.iter().any(|r| r == recipient_id) {
                list.push(recipient_id.to_owned());
            }
        } else {
            list.retain(|r| r != recipient_id);
        }
    }
}

#[async_trait]
impl TransportNode for MemoryTransport {
    fn subscribe(&self, recipient_id: &str) -> mpsc::UnboundedReceiver<PrivateMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(recipient_id.to_owned(), tx);
        rx
    }

    async fn publish_private(&self, message: PrivateMessage) -> CoreResult<()> {
        if self.unreachable.lock().iter().any(|r| *r == message.recipient_id) {
            return Err(CoreError::network(format!(
                "recipient {} unreachable",
                message.recipient_id
            )));
        }
        let subscribers = self.subscribers.lock();
        match subscribers.get(&message.recipient_id) {
            Some(tx) => tx
                .send(message)
                .map_err(|_| CoreError::network("recipient subscription closed")),
            // Nobody listening locally: the message is accepted and dropped,
            // like a store-and-forward node with no fetcher.
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_local_subscriber() {
        let transport = MemoryTransport::new();
        let mut rx = transport.subscribe("aim1bob");
        transport
            .publish_private(PrivateMessage {
                id: Uuid::new_v4(),
                sender_id: "aim1alice".into(),
                recipient_id: "aim1bob".into(),
                payload: b"{}".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().sender_id, "aim1alice");
    }

    #[tokio::test]
    async fn unreachable_recipient_is_a_network_error() {
        let transport = MemoryTransport::new();
        transport.set_unreachable("aim1bob", true);
        let err = transport
            .publish_private(PrivateMessage {
                id: Uuid::new_v4(),
                sender_id: "aim1alice".into(),
                recipient_id: "aim1bob".into(),
                payload: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), aim_common::ErrorCategory::Network);
    }
}
