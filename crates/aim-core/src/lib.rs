//! # aim-core
//!
//! The messaging pipeline: outbound send path, inbound processing state
//! machine, retry/dispatch loop, device-revocation fan-out, and the
//! notification bus. External subsystems (transport node, privacy policy,
//! group routing, message requests, blob store) are collaborator traits.

pub mod backup;
pub mod collab;
pub mod dispatch;
pub mod inbound;
pub mod notify;
pub mod outbound;
pub mod revocation;
pub mod transport;
pub mod uploads;
pub mod wiring;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use aim_identity::IdentityKernel;
use aim_session::SessionManager;
use aim_store::Store;

use collab::{GroupRouter, StatePersister};
use notify::NotificationBus;
use transport::TransportNode;

/// Shared state handed to every service.
///
/// Mirrors the composition root: one kernel, one session manager, one store,
/// one bus, one transport — everything else borrows through this.
#[derive(Clone)]
pub struct CoreContext {
    pub kernel: Arc<IdentityKernel>,
    pub sessions: Arc<SessionManager>,
    pub store: Arc<Store>,
    pub bus: Arc<NotificationBus>,
    pub transport: Arc<dyn TransportNode>,
    pub groups: Arc<dyn GroupRouter>,
    pub persister: Arc<dyn StatePersister>,
}
