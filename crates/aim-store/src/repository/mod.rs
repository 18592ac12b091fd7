//! Repository modules — the message log and the pending-send queue.

pub mod messages;
pub mod pending;

pub use messages::{MessageLogSnapshot, MessageRepository};
pub use pending::{PendingQueue, PendingQueueSnapshot};
