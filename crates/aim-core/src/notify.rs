//! Process-wide notification bus.
//!
//! Publishing assigns the next sequence number and never blocks: the live
//! side is a tokio broadcast channel, whose lagging receivers drop the
//! oldest events rather than stalling publishers. A bounded backlog ring is
//! kept for cursor replay — `subscribe(cursor)` atomically snapshots every
//! retained event with `seq > cursor` and opens a live stream starting at
//! the next sequence, so a subscriber sees each event exactly once (modulo
//! overflow drop under back-pressure).

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use aim_common::notify::NotificationEvent;

/// Default number of events retained for cursor replay.
pub const DEFAULT_BACKLOG: usize = 1024;
/// Default per-subscriber live buffer before drop-oldest kicks in.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct BusInner {
    seq: u64,
    backlog: VecDeque<NotificationEvent>,
    backlog_cap: usize,
    live: broadcast::Sender<NotificationEvent>,
}

/// A subscription: replayed backlog plus the live receiver. Dropping the
/// receiver cancels the subscription.
pub struct Subscription {
    pub backlog: Vec<NotificationEvent>,
    pub live: broadcast::Receiver<NotificationEvent>,
}

/// The process-wide event bus.
pub struct NotificationBus {
    inner: Mutex<BusInner>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl NotificationBus {
    pub fn new(backlog_cap: usize, subscriber_buffer: usize) -> Self {
        let (live, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            inner: Mutex::new(BusInner {
                seq: 0,
                backlog: VecDeque::with_capacity(backlog_cap.min(4096)),
                backlog_cap: backlog_cap.max(1),
                live,
            }),
        }
    }

    /// Publish an event, returning its sequence number.
    pub fn publish(&self, method: &str, payload: serde_json::Value) -> u64 {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let event = NotificationEvent {
            seq: inner.seq,
            method: method.to_owned(),
            payload,
            timestamp: Utc::now(),
        };
        if inner.backlog.len() == inner.backlog_cap {
            inner.backlog.pop_front();
        }
        inner.backlog.push_back(event.clone());
        // No receivers is fine; broadcast only errors when empty.
        let _ = inner.live.send(event);
        tracing::trace!(method, seq = inner.seq, "published notification");
        inner.seq
    }

    /// Subscribe from a cursor: replay retained events with `seq > cursor`,
    /// then stream live from the next sequence.
    pub fn subscribe(&self, cursor: u64) -> Subscription {
        let inner = self.inner.lock();
        // Taking the receiver under the lock makes snapshot + stream handoff
        // atomic with respect to publishers.
        let live = inner.live.subscribe();
        let backlog = inner
            .backlog
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect();
        Subscription { backlog, live }
    }

    /// The sequence number of the most recently published event.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().seq
    }
}
