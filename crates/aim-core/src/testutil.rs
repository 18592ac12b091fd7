//! Shared fixtures for service-level tests: two full daemons wired to one
//! in-process transport.

use std::sync::Arc;

use tokio::sync::mpsc;

use aim_identity::IdentityKernel;
use aim_session::SessionManager;
use aim_store::Store;

use crate::collab::{AcceptAllPolicy, InMemoryMessageRequests, NoGroups, NoPersistence};
use crate::dispatch::DispatchQueue;
use crate::inbound::Inbound;
use crate::notify::NotificationBus;
use crate::outbound::Messaging;
use crate::transport::{MemoryTransport, PrivateMessage, TransportNode};
use crate::CoreContext;

/// One test daemon: identity, sessions, store, services, and its own
/// subscription on the shared transport.
pub struct TestNode {
    pub id: String,
    pub ctx: Arc<CoreContext>,
    pub queue: Arc<DispatchQueue>,
    pub messaging: Messaging,
    pub inbound: Inbound,
    pub requests: Arc<InMemoryMessageRequests>,
    pub rx: mpsc::UnboundedReceiver<PrivateMessage>,
}

impl TestNode {
    pub fn new(name: &str, transport: &Arc<MemoryTransport>) -> Self {
        let kernel = Arc::new(IdentityKernel::new());
        kernel.create_identity(name, "pw", "laptop").unwrap();
        let id = kernel.identity().unwrap().id;

        let secret = kernel.snapshot().signing_secret.unwrap();
        let sessions = Arc::new(SessionManager::from_identity_secret(&secret));

        let ctx = Arc::new(CoreContext {
            kernel,
            sessions,
            store: Arc::new(Store::new()),
            bus: Arc::new(NotificationBus::default()),
            transport: transport.clone() as Arc<dyn TransportNode>,
            groups: Arc::new(NoGroups),
            persister: Arc::new(NoPersistence),
        });

        let queue = DispatchQueue::new();
        let requests = Arc::new(InMemoryMessageRequests::default());
        let messaging = Messaging::new(ctx.clone(), queue.clone());
        let inbound = Inbound::new(ctx.clone(), Arc::new(AcceptAllPolicy), requests.clone());
        let rx = transport.subscribe(&id);

        Self { id, ctx, queue, messaging, inbound, requests, rx }
    }

    pub fn card(&self) -> aim_common::models::ContactCard {
        self.ctx.kernel.self_contact_card().unwrap()
    }
}

/// Two nodes that know each other's cards, sharing one transport.
pub fn connected_pair() -> (TestNode, TestNode, Arc<MemoryTransport>) {
    let transport = MemoryTransport::new();
    let alice = TestNode::new("Alice", &transport);
    let bob = TestNode::new("Bob", &transport);
    alice.ctx.kernel.add_contact(&bob.card()).unwrap();
    bob.ctx.kernel.add_contact(&alice.card()).unwrap();
    (alice, bob, transport)
}

/// Establish ratchet sessions in both directions.
pub fn establish_sessions(alice: &TestNode, bob: &TestNode) {
    alice
        .ctx
        .sessions
        .init_session(&bob.id, &bob.ctx.sessions.local_public_key())
        .unwrap();
    bob.ctx
        .sessions
        .init_session(&alice.id, &alice.ctx.sessions.local_public_key())
        .unwrap();
}
