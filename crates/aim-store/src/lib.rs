//! # aim-store
//!
//! Persistence layer: the in-memory message log and pending queue with their
//! envelope-backed snapshots, the encrypted state envelope file, and the
//! backup blob codec. No business logic — services above decide *when* to
//! persist; this crate decides *how*.

pub mod backup;
pub mod envelope;
pub mod repository;

use serde::{Deserialize, Serialize};

pub use backup::{decode_backup, encode_backup, BackupDocument};
pub use envelope::{read_envelope, write_envelope, StateDocument};
pub use repository::{MessageLogSnapshot, MessageRepository, PendingQueue, PendingQueueSnapshot};

/// The message log and pending queue as one unit, the way services hold it.
#[derive(Default)]
pub struct Store {
    pub messages: MessageRepository,
    pub pending: PendingQueue,
}

/// Combined store snapshot, persisted inside `runtime_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub messages: MessageLogSnapshot,
    pub pending: PendingQueueSnapshot,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            messages: self.messages.snapshot(),
            pending: self.pending.snapshot(),
        }
    }

    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.messages.restore(snapshot.messages);
        self.pending.restore(snapshot.pending);
    }
}
