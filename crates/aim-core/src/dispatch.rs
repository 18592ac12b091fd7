//! Retry & dispatch loop.
//!
//! A single long-running task drains due pending rows once per second,
//! publishes them, and reschedules failures with bounded exponential
//! backoff. Only `network` failures retry; `crypto`/`api`/`storage`
//! failures mark the row failed for the operator. The loop is a pure
//! consumer of the repository-owned queue: it touches retry metadata and
//! nothing else on the message.
//!
//! The send path parks its already-built wire in the [`DispatchQueue`];
//! the first attempt uses it, every later attempt rebuilds the wire because
//! sessions may have advanced since.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use aim_common::error::{record_error, CoreError, CoreResult};
use aim_common::models::{MessageStatus, PendingMessage};
use aim_common::notify::METHOD_MESSAGE_STATUS;
use aim_common::wire::WirePayload;

use crate::transport::PrivateMessage;
use crate::wiring::build_message_wire;
use crate::CoreContext;

/// Interval between dispatch ticks.
pub const RETRY_LOOP_TICK: Duration = Duration::from_secs(1);
/// First retry delay; doubles per retry.
const RETRY_BASE_DELAY_SECS: i64 = 2;
/// Backoff ceiling.
const RETRY_MAX_DELAY_SECS: i64 = 30;
/// Window around now scanned for stranded rows at startup.
const STARTUP_RECOVERY_LOOKAHEAD_HOURS: i64 = 24;

/// Backoff delay before retry number `retry_count` (1-based):
/// `min(2^(n−1) · 2 s, 30 s)`.
pub fn next_retry_delay(retry_count: u32) -> chrono::Duration {
    let exp = retry_count.saturating_sub(1).min(5);
    let secs = (RETRY_BASE_DELAY_SECS << exp).min(RETRY_MAX_DELAY_SECS);
    chrono::Duration::seconds(secs)
}

/// Hand-off point between the send path and the loop.
#[derive(Default)]
pub struct DispatchQueue {
    prepared: Mutex<HashMap<Uuid, WirePayload>>,
    wake: Notify,
}

impl DispatchQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Park the wire built during send for the first publish attempt.
    pub fn offer(&self, message_id: Uuid, wire: WirePayload) {
        self.prepared.lock().insert(message_id, wire);
        self.wake.notify_one();
    }

    /// Take a parked wire; later attempts rebuild instead.
    pub fn take(&self, message_id: &Uuid) -> Option<WirePayload> {
        self.prepared.lock().remove(message_id)
    }

    /// Drop a parked wire (message deleted before first attempt).
    pub fn discard(&self, message_id: &Uuid) {
        self.prepared.lock().remove(message_id);
    }

    async fn notified(&self) {
        self.wake.notified().await
    }
}

/// Handle for stopping the dispatch loop.
pub struct DispatchHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DispatchHandle {
    /// Request a graceful stop; an in-flight publish completes first.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The background dispatcher.
pub struct DispatchLoop {
    ctx: Arc<CoreContext>,
    queue: Arc<DispatchQueue>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl DispatchLoop {
    pub fn new(ctx: Arc<CoreContext>, queue: Arc<DispatchQueue>) -> (Self, DispatchHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (Self { ctx, queue, shutdown_rx }, DispatchHandle { shutdown_tx })
    }

    /// Run the loop. Spawn as a background task.
    pub async fn run(mut self) {
        tracing::info!("dispatch loop starting");
        self.recover_startup_backlog().await;

        let mut interval = tokio::time::interval(RETRY_LOOP_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.drain_due().await,
                _ = self.queue.notified() => self.drain_due().await,
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("dispatch loop shutting down");
                    break;
                }
            }
        }
    }

    /// Drain any rows stranded by a previous process around now.
    async fn recover_startup_backlog(&self) {
        let now = Utc::now();
        let window = self
            .ctx
            .store
            .pending
            .within_window(now, chrono::Duration::hours(STARTUP_RECOVERY_LOOKAHEAD_HOURS));
        if window.is_empty() {
            return;
        }
        tracing::info!(count = window.len(), "recovering pending backlog");
        self.attempt_in_order(window, now).await;
    }

    async fn drain_due(&self) {
        let now = Utc::now();
        let due = self.ctx.store.pending.due(now);
        if !due.is_empty() {
            self.attempt_in_order(due, now).await;
        }
    }

    /// Attempt rows in insertion order; a failed contact blocks its own
    /// later rows for this pass so per-contact order holds across retries.
    async fn attempt_in_order(&self, rows: Vec<PendingMessage>, now: DateTime<Utc>) {
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        for row in rows {
            if blocked.contains(&row.contact_id) {
                continue;
            }
            let contact = row.contact_id.clone();
            if !self.attempt(row, now).await {
                blocked.insert(contact);
            }
        }
    }

    /// One publish attempt. Returns whether the row left the queue happily.
    async fn attempt(&self, mut row: PendingMessage, now: DateTime<Utc>) -> bool {
        let Some(message) = self.ctx.store.messages.get(&row.message_id) else {
            // Message deleted under the row; nothing left to deliver.
            self.ctx.store.pending.remove(&row.message_id);
            return true;
        };

        let wire = match self.queue.take(&row.message_id) {
            Some(prepared) => prepared,
            None => match build_message_wire(&self.ctx, &message) {
                Ok(wire) => wire,
                Err(err) => {
                    self.abandon(&row, err).await;
                    return false;
                }
            },
        };

        let result = self.publish(&message.contact_id, &message.id, &wire).await;
        match result {
            Ok(()) => {
                self.ctx.store.pending.remove(&row.message_id);
                let _ = self
                    .ctx
                    .store
                    .messages
                    .advance_status(&row.message_id, MessageStatus::Sent);
                self.ctx.bus.publish(
                    METHOD_MESSAGE_STATUS,
                    serde_json::json!({
                        "message_id": row.message_id,
                        "status": MessageStatus::Sent,
                        "edited": false,
                    }),
                );
                self.ctx.persister.checkpoint().await;
                tracing::debug!(message = %row.message_id, "published pending message");
                true
            }
            Err(err) if err.category().is_retryable() => {
                record_error(err.category(), &err);
                row.retry_count += 1;
                row.next_retry = now + next_retry_delay(row.retry_count);
                row.last_error = Some(err.to_string());
                self.ctx.store.pending.update(&row);
                self.ctx.persister.checkpoint().await;
                tracing::debug!(
                    message = %row.message_id,
                    retry = row.retry_count,
                    next = %row.next_retry,
                    "publish failed, rescheduled"
                );
                false
            }
            Err(err) => {
                self.abandon(&row, err).await;
                false
            }
        }
    }

    async fn publish(&self, contact_id: &str, message_id: &Uuid, wire: &WirePayload) -> CoreResult<()> {
        let sender_id = self.ctx.kernel.require_identity()?.id;
        let payload = wire
            .encode()
            .map_err(|e| CoreError::api(format!("wire serialization: {e}")))?;
        self.ctx
            .transport
            .publish_private(PrivateMessage {
                id: *message_id,
                sender_id,
                recipient_id: contact_id.to_owned(),
                payload,
            })
            .await
    }

    /// A non-retryable failure: mark the row failed and stop retrying.
    async fn abandon(&self, row: &PendingMessage, err: CoreError) {
        record_error(err.category(), &err);
        self.ctx.store.pending.remove(&row.message_id);
        let _ = self
            .ctx
            .store
            .messages
            .advance_status(&row.message_id, MessageStatus::Failed);
        self.ctx.bus.publish(
            METHOD_MESSAGE_STATUS,
            serde_json::json!({
                "message_id": row.message_id,
                "status": MessageStatus::Failed,
                "edited": false,
                "error": err.to_string(),
            }),
        );
        self.ctx.persister.checkpoint().await;
        tracing::warn!(message = %row.message_id, error = %err, "abandoned pending message");
    }
}
