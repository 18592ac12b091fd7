//! Chunked upload sessions.
//!
//! Large attachments arrive as chunks against an upload session. Sessions
//! are guarded by a single mutex and reaped after 15 minutes of inactivity.
//! Commit runs the attachment normalizer and hands the sanitized bytes to
//! the blob-store collaborator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use aim_common::error::{CoreError, CoreResult};
use aim_common::media::{self, AttachmentRoute};

use crate::collab::BlobStore;

/// Idle time after which an upload session is reaped.
pub const UPLOAD_SESSION_TTL: Duration = Duration::from_secs(15 * 60);
/// How often the reaper scans for idle sessions.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

struct UploadSession {
    mime: String,
    bytes: Vec<u8>,
    last_activity: DateTime<Utc>,
}

/// Progress of one upload session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadStatus {
    pub upload_id: Uuid,
    pub received_bytes: usize,
    pub mime: String,
}

/// Committed upload: the blob ID plus sanitized metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommittedUpload {
    pub blob_id: Uuid,
    pub mime: String,
    pub size: usize,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Upload-session manager.
pub struct Uploads {
    blobs: Arc<dyn BlobStore>,
    sessions: Mutex<HashMap<Uuid, UploadSession>>,
}

impl Uploads {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Arc<Self> {
        Arc::new(Self { blobs, sessions: Mutex::new(HashMap::new()) })
    }

    /// Store a small attachment in one shot (the `file.put` path).
    pub async fn put(&self, mime: &str, bytes: Vec<u8>) -> CoreResult<CommittedUpload> {
        let normalized = media::normalize_attachment(mime, bytes, AttachmentRoute::Direct)?;
        let size = normalized.bytes.len();
        let blob_id = self.blobs.put(normalized.bytes, &normalized.mime).await?;
        Ok(CommittedUpload {
            blob_id,
            mime: normalized.mime,
            size,
            width: normalized.width,
            height: normalized.height,
        })
    }

    /// Open a chunked upload session.
    pub fn init(&self, mime: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.lock().insert(
            id,
            UploadSession {
                mime: mime.trim().to_owned(),
                bytes: Vec::new(),
                last_activity: Utc::now(),
            },
        );
        id
    }

    /// Append a chunk; the chunked size cap applies to the running total.
    pub fn append_chunk(&self, upload_id: &Uuid, chunk: &[u8]) -> CoreResult<UploadStatus> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| CoreError::not_found("upload session"))?;
        if session.bytes.len() + chunk.len() > media::MAX_CHUNKED_ATTACHMENT_BYTES {
            sessions.remove(upload_id);
            return Err(CoreError::api("upload exceeds chunked size limit"));
        }
        session.bytes.extend_from_slice(chunk);
        session.last_activity = Utc::now();
        Ok(UploadStatus {
            upload_id: *upload_id,
            received_bytes: session.bytes.len(),
            mime: session.mime.clone(),
        })
    }

    pub fn status(&self, upload_id: &Uuid) -> CoreResult<UploadStatus> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(upload_id)
            .ok_or_else(|| CoreError::not_found("upload session"))?;
        Ok(UploadStatus {
            upload_id: *upload_id,
            received_bytes: session.bytes.len(),
            mime: session.mime.clone(),
        })
    }

    /// Normalize the assembled bytes and persist them as a blob.
    pub async fn commit(&self, upload_id: &Uuid) -> CoreResult<CommittedUpload> {
        let session = self
            .sessions
            .lock()
            .remove(upload_id)
            .ok_or_else(|| CoreError::not_found("upload session"))?;
        let normalized =
            media::normalize_attachment(&session.mime, session.bytes, AttachmentRoute::Chunked)?;
        let size = normalized.bytes.len();
        let blob_id = self.blobs.put(normalized.bytes, &normalized.mime).await?;
        Ok(CommittedUpload {
            blob_id,
            mime: normalized.mime,
            size,
            width: normalized.width,
            height: normalized.height,
        })
    }

    /// Drop sessions idle past the TTL. Returns how many were reaped.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(UPLOAD_SESSION_TTL).expect("ttl fits");
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now - s.last_activity < ttl);
        let reaped = before - sessions.len();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle upload sessions");
        }
        reaped
    }

    /// Spawn the TTL reaper. Returns a sender whose drop stops the task.
    pub fn spawn_reaper(self: &Arc<Self>) -> mpsc::Sender<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let uploads = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        uploads.reap_idle(Utc::now());
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::InMemoryBlobStore;

    fn uploads() -> Arc<Uploads> {
        Uploads::new(Arc::new(InMemoryBlobStore::default()))
    }

    #[tokio::test]
    async fn chunked_upload_commits_to_blob_store() {
        let uploads = uploads();
        let id = uploads.init("application/octet-stream");
        uploads.append_chunk(&id, b"hello ").unwrap();
        uploads.append_chunk(&id, b"world").unwrap();
        assert_eq!(uploads.status(&id).unwrap().received_bytes, 11);

        let committed = uploads.commit(&id).await.unwrap();
        assert_eq!(committed.size, 11);
        // Session is gone after commit.
        assert!(uploads.status(&id).is_err());
    }

    #[test]
    fn idle_sessions_are_reaped() {
        let uploads = uploads();
        let id = uploads.init("application/pdf");
        assert_eq!(uploads.reap_idle(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::minutes(16);
        assert_eq!(uploads.reap_idle(later), 1);
        assert!(uploads.status(&id).is_err());
    }

    #[tokio::test]
    async fn image_claim_is_sanitized_on_commit() {
        let uploads = uploads();
        let id = uploads.init("image/png");
        uploads.append_chunk(&id, b"definitely not a png").unwrap();
        assert!(uploads.commit(&id).await.is_err());
    }
}
