//! Envelope-backed persistence for the daemon.
//!
//! Services call `checkpoint()` after mutations; the Argon2-sealed envelope
//! write is heavy, so checkpoints only mark state dirty and a background
//! flusher performs the actual write — plus one final flush at shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use aim_common::error::{CoreError, CoreResult};
use aim_core::collab::StatePersister;
use aim_identity::{IdentityKernel, KernelSnapshot};
use aim_session::{SessionManager, SessionState};
use aim_store::{self as store, StateDocument, Store, StoreSnapshot};

/// Seconds between dirty-state flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// What `runtime_state` holds inside the envelope.
#[derive(serde::Serialize, serde::Deserialize)]
struct RuntimeState {
    kernel: KernelSnapshot,
    store: StoreSnapshot,
    sessions: Vec<SessionState>,
}

/// Writes daemon state into the encrypted envelope file.
///
/// The target path can be swapped at runtime (account switch); flushes and
/// loads always go against the current target.
pub struct EnvelopePersister {
    kernel: Arc<IdentityKernel>,
    sessions: Arc<SessionManager>,
    store: Arc<Store>,
    path: RwLock<PathBuf>,
    passphrase: String,
    dirty: AtomicBool,
}

impl EnvelopePersister {
    pub fn new(
        kernel: Arc<IdentityKernel>,
        sessions: Arc<SessionManager>,
        store: Arc<Store>,
        path: PathBuf,
        passphrase: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            sessions,
            store,
            path: RwLock::new(path),
            passphrase,
            dirty: AtomicBool::new(false),
        })
    }

    /// The envelope file currently being written.
    pub fn current_path(&self) -> PathBuf {
        self.path.read().clone()
    }

    /// Point the persister at another envelope file. The caller flushes the
    /// old target first and loads the new one after.
    pub fn retarget(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    /// Seal and write current state to disk.
    pub fn flush_now(&self) -> CoreResult<()> {
        let mut kernel = self.kernel.snapshot();
        // The top-level envelope fields own the key material; runtime_state
        // carries the rest.
        let signing_private_key = serde_json::to_value(kernel.signing_secret.take())
            .map_err(|e| CoreError::storage(format!("state serialization: {e}")))?;
        let seed_envelope = serde_json::to_value(kernel.seed_envelope.take())
            .map_err(|e| CoreError::storage(format!("state serialization: {e}")))?;
        let runtime = RuntimeState {
            kernel,
            store: self.store.snapshot(),
            sessions: self.sessions.snapshot(),
        };
        let document = StateDocument {
            signing_private_key,
            seed_envelope,
            runtime_state: serde_json::to_value(&runtime)
                .map_err(|e| CoreError::storage(format!("state serialization: {e}")))?,
        };
        store::write_envelope(&self.current_path(), &self.passphrase, &document)
    }

    /// Load state from an existing envelope file into the live components.
    pub fn load(&self) -> CoreResult<()> {
        let document = store::read_envelope(&self.current_path(), &self.passphrase)?;
        let mut runtime: RuntimeState = serde_json::from_value(document.runtime_state)
            .map_err(|e| CoreError::storage(format!("malformed runtime state: {e}")))?;
        runtime.kernel.signing_secret = serde_json::from_value(document.signing_private_key)
            .map_err(|e| CoreError::storage(format!("malformed signing key: {e}")))?;
        runtime.kernel.seed_envelope = serde_json::from_value(document.seed_envelope)
            .map_err(|e| CoreError::storage(format!("malformed seed envelope: {e}")))?;

        if let Some(secret) = &runtime.kernel.signing_secret {
            self.sessions.rekey_from_identity_secret(secret);
        }
        self.kernel.restore(runtime.kernel)?;
        self.sessions.restore(runtime.sessions);
        self.store.restore(runtime.store);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.current_path().exists()
    }

    /// Spawn the background flusher. Dropping the returned sender stops it
    /// after one final flush.
    pub fn spawn_flusher(self: &Arc<Self>) -> mpsc::Sender<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let persister = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => persister.flush_if_dirty().await,
                    _ = shutdown_rx.recv() => {
                        persister.flush_if_dirty().await;
                        break;
                    }
                }
            }
        });
        shutdown_tx
    }

    async fn flush_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let result = tokio::task::block_in_place(|| self.flush_now());
        if let Err(err) = result {
            // Keep the dirty bit so the next tick retries.
            self.dirty.store(true, Ordering::Release);
            tracing::error!(error = %err, "state envelope flush failed");
        }
    }
}

#[async_trait]
impl StatePersister for EnvelopePersister {
    async fn checkpoint(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}
