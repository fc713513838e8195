//! src/services/multipart_registry.rs
//!
//! In-memory registry of multipart upload sessions.
//!
//! Each session owns a scratch directory under `temp_root/<upload_id>` that
//! holds one file per part (`<upload_id>.<part_number>.part`). A session
//! leaves the `Initiated` state exactly once: through `complete`, `abort`, or
//! the expiry task that fires after the configured TTL. Every terminal
//! transition takes the session's write lock and re-checks the state, so a
//! client `complete` racing the expiry timer resolves to exactly one winner.
//! The scratch directory is removed before the id is deregistered and before
//! the lock is released.

use crate::{
    models::multipart::{CompletedUpload, UploadRequest, UploadState},
    services::{object_path, stream_merger},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default lifetime of an idle upload.
pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum MultipartError {
    /// Never created, already completed, aborted or expired.
    #[error("upload `{0}` does not exist")]
    UnknownUpload(String),
    /// The upload is live but has no parts to assemble.
    #[error("upload `{0}` has no uploaded parts")]
    NoSuchUpload(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type MultipartResult<T> = Result<T, MultipartError>;

struct Session {
    upload_id: String,
    request: UploadRequest,
    scratch_dir: PathBuf,
    state: RwLock<UploadState>,
    expiry: CancellationToken,
}

impl Session {
    fn part_path(&self, part_number: u32) -> PathBuf {
        self.scratch_dir
            .join(format!("{}.{}.part", self.upload_id, part_number))
    }
}

struct Inner {
    uploads: Mutex<HashMap<String, Arc<Session>>>,
    temp_root: PathBuf,
    storage_root: PathBuf,
    ttl: Duration,
}

/// Shared handle to the multipart state machine. Cheap to clone.
#[derive(Clone)]
pub struct MultipartRegistry {
    inner: Arc<Inner>,
}

impl MultipartRegistry {
    /// `temp_root` holds per-upload scratch directories; completed objects are
    /// written beneath `storage_root`.
    pub fn new(
        temp_root: impl Into<PathBuf>,
        storage_root: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                uploads: Mutex::new(HashMap::new()),
                temp_root: temp_root.into(),
                storage_root: storage_root.into(),
                ttl,
            }),
        }
    }

    /// Register a new upload and arm its expiry timer.
    pub async fn create(&self, request: UploadRequest) -> MultipartResult<String> {
        let upload_id = Uuid::new_v4().simple().to_string();
        let scratch_dir = self.inner.temp_root.join(&upload_id);
        fs::create_dir_all(&scratch_dir).await?;

        let session = Arc::new(Session {
            upload_id: upload_id.clone(),
            request,
            scratch_dir,
            state: RwLock::new(UploadState::Initiated),
            expiry: CancellationToken::new(),
        });

        self.uploads()
            .insert(upload_id.clone(), Arc::clone(&session));
        self.schedule_expiry(&session);

        info!(
            upload_id = %upload_id,
            bucket = %session.request.bucket,
            key = %session.request.key,
            "Initiated multipart upload"
        );
        Ok(upload_id)
    }

    /// Store (or overwrite) one part and return the hex MD5 of its bytes.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        bytes: &[u8],
    ) -> MultipartResult<String> {
        let session = self.lookup(upload_id)?;
        let state = session.state.read().await;
        if !state.is_live() {
            return Err(MultipartError::UnknownUpload(upload_id.to_string()));
        }

        stream_merger::write_atomic(&session.part_path(part_number), bytes).await?;
        debug!(upload_id, part_number, size = bytes.len(), "stored part");

        Ok(format!("{:x}", md5::compute(bytes)))
    }

    /// Merge all parts, in numeric part order, into the upload's object path.
    ///
    /// On a merge failure the upload stays live (and its timer armed) so the
    /// client may retry or abort.
    pub async fn complete(&self, upload_id: &str) -> MultipartResult<CompletedUpload> {
        let session = self.lookup(upload_id)?;
        let mut state = session.state.write().await;
        if !state.is_live() {
            return Err(MultipartError::UnknownUpload(upload_id.to_string()));
        }

        let parts = list_parts(&session.scratch_dir, upload_id).await?;
        if parts.is_empty() {
            return Err(MultipartError::NoSuchUpload(upload_id.to_string()));
        }

        let target = object_path(
            &self.inner.storage_root,
            &session.request.bucket,
            &session.request.key,
        );
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part_count = parts.len();
        let inputs: Vec<PathBuf> = parts.into_iter().map(|(_, path)| path).collect();
        let summary = stream_merger::merge(&inputs, &target).await?;

        *state = UploadState::Completed;
        session.expiry.cancel();
        remove_scratch(&session.scratch_dir).await;
        self.deregister(upload_id);
        drop(state);

        info!(
            upload_id,
            bucket = %session.request.bucket,
            key = %session.request.key,
            parts = part_count,
            size = summary.size,
            "Completed multipart upload"
        );

        Ok(CompletedUpload {
            bucket: session.request.bucket.clone(),
            key: session.request.key.clone(),
            mime: session.request.mime.clone(),
            disposition: session.request.disposition.clone(),
            size: summary.size,
            etag: summary.md5,
            part_count,
        })
    }

    /// Discard an upload and its parts.
    pub async fn abort(&self, upload_id: &str) -> MultipartResult<()> {
        let session = self.lookup(upload_id)?;
        let mut state = session.state.write().await;
        if !state.is_live() {
            return Err(MultipartError::UnknownUpload(upload_id.to_string()));
        }

        *state = UploadState::Aborted;
        session.expiry.cancel();
        remove_scratch(&session.scratch_dir).await;
        self.deregister(upload_id);
        drop(state);

        info!(upload_id, "Aborted multipart upload");
        Ok(())
    }

    /// Whether `upload_id` is currently accepting parts.
    pub fn is_registered(&self, upload_id: &str) -> bool {
        self.uploads().contains_key(upload_id)
    }

    /// Number of live uploads.
    pub fn active_uploads(&self) -> usize {
        self.uploads().len()
    }

    /// Scratch directory that a given upload id maps to.
    pub fn scratch_dir(&self, upload_id: &str) -> PathBuf {
        self.inner.temp_root.join(upload_id)
    }

    async fn expire(&self, upload_id: &str) {
        let Ok(session) = self.lookup(upload_id) else {
            return;
        };
        let mut state = session.state.write().await;
        if !state.is_live() {
            return;
        }

        *state = UploadState::Expired;
        remove_scratch(&session.scratch_dir).await;
        self.deregister(upload_id);
        drop(state);

        info!(
            upload_id,
            bucket = %session.request.bucket,
            key = %session.request.key,
            "Expired multipart upload"
        );
    }

    fn schedule_expiry(&self, session: &Arc<Session>) {
        let token = session.expiry.clone();
        let upload_id = session.upload_id.clone();
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let ttl = self.inner.ttl;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Some(inner) = registry.upgrade() {
                        MultipartRegistry { inner }.expire(&upload_id).await;
                    }
                }
            }
        });
    }

    fn lookup(&self, upload_id: &str) -> MultipartResult<Arc<Session>> {
        self.uploads()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| MultipartError::UnknownUpload(upload_id.to_string()))
    }

    fn deregister(&self, upload_id: &str) {
        self.uploads().remove(upload_id);
    }

    fn uploads(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Part files of an upload, sorted by numeric part number.
async fn list_parts(scratch_dir: &Path, upload_id: &str) -> io::Result<Vec<(u32, PathBuf)>> {
    let prefix = format!("{}.", upload_id);
    let mut parts = Vec::new();

    let mut entries = fs::read_dir(scratch_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let number = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".part"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(number) = number {
            parts.push((number, entry.path()));
        }
    }

    parts.sort_by_key(|(number, _)| *number);
    Ok(parts)
}

async fn remove_scratch(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!("removed scratch directory {}", dir.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "failed to remove scratch directory {}: {}",
            dir.display(),
            err
        ),
    }
}
