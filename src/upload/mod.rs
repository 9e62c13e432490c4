/// Upload pipeline
///
/// An upload is streamed through a size bound and a hasher into a local
/// spool file, because the digest (and so the dedup decision) is only known
/// at EOF. Then either an existing blob is reused or the spool is handed to
/// the backend, and the record and quota charge are committed together.
///
/// The record goes `pending` (name reserved) → `uploading` → `completed`.
/// Any failure removes the spool, any blob this upload stored, and the row.
/// The blob key is written to the row before the backend sees any bytes,
/// so even an upload whose future is dropped, or whose process dies, leaves
/// a row the stale reaper can purge together with the blob.
pub mod spool;

use crate::blob_store::{new_storage_key, BlobBackend, SaveOptions};
use crate::config::ServerConfig;
use crate::db::{CommitOutcome, FileRecord, FileStatus, MetadataStore, UploadCommit};
use crate::error::{TroveError, TroveResult};
use crate::files::{clean_file_name, folders::normalize_path};
use crate::stream::{copy_buffered, BoundedReader, FileTooLarge, HashingReader};
use spool::SpoolFile;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OCTET_STREAM: &str = "application/octet-stream";

/// Bounds on how often an in-flight upload refreshes its row
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);
const MAX_HEARTBEAT: Duration = Duration::from_secs(300);

/// Row refresh period for a given stale-upload retention
///
/// Several beats fit in one retention window, so a slow but live upload is
/// never taken for an abandoned one.
pub fn heartbeat_interval(retention: Duration) -> Duration {
    (retention / 4).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

/// What the client told us about an upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// File name as sent by the client
    pub original_name: String,
    /// Name to show; defaults to the original name
    pub display_name: Option<String>,
    /// Target folder; defaults to the root
    pub folder_path: String,
    pub content_type: Option<String>,
    /// Size announced ahead of the body, if any
    pub declared_size: Option<u64>,
}

/// Pick the stored MIME type
///
/// A specific client hint wins; otherwise guess from the file name.
pub fn choose_mime_type(hint: Option<&str>, file_name: &str) -> String {
    if let Some(hint) = hint.map(str::trim) {
        if !hint.is_empty() && hint.contains('/') && !hint.eq_ignore_ascii_case(OCTET_STREAM) {
            return hint.to_ascii_lowercase();
        }
    }

    mime_guess::from_path(file_name)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Upload pipeline
#[derive(Clone)]
pub struct UploadPipeline {
    store: MetadataStore,
    backend: Arc<dyn BlobBackend>,
    config: Arc<ServerConfig>,
}

/// Names and placement of an upload after validation
struct Target {
    original_name: String,
    display_name: String,
    folder: String,
    mime_type: String,
}

impl UploadPipeline {
    pub fn new(
        store: MetadataStore,
        backend: Arc<dyn BlobBackend>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    /// Stream `reader` into storage as a new file owned by `user_id`
    pub async fn upload<R>(
        &self,
        user_id: i64,
        request: UploadRequest,
        reader: R,
        cancel: &CancellationToken,
    ) -> TroveResult<FileRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let original_name = clean_file_name(&request.original_name)?;
        let display_name = match request.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => clean_file_name(name)?,
            _ => original_name.clone(),
        };
        let folder = normalize_path(&request.folder_path)?;
        let mime_type = choose_mime_type(request.content_type.as_deref(), &display_name);

        // 1. Pre-flight quota check
        self.preflight(user_id, request.declared_size).await?;

        // 2. Reserve the name
        self.store.ensure_folder(user_id, &folder).await?;
        let row = self
            .store
            .reserve_upload(user_id, &folder, &display_name, &original_name, &mime_type)
            .await?;
        debug!(
            "Reserved upload {} as {}/{}",
            row.id, folder, row.display_name
        );

        let target = Target {
            original_name,
            display_name: row.display_name.clone(),
            folder,
            mime_type,
        };

        // From here on a dropped future still gets its row cleaned up
        let mut guard = AbandonOnDrop::new(self.clone(), row.id);

        // 3..6. Stream, dedup, store, commit
        let result = match self.ingest(user_id, row.id, &target, reader, cancel).await {
            Ok(file) => Ok(file),
            Err(e) => {
                self.abandon_row(row.id, &e).await;
                Err(e)
            }
        };
        guard.disarm();
        result
    }

    async fn preflight(&self, user_id: i64, declared_size: Option<u64>) -> TroveResult<()> {
        let max = self.config.limits.max_upload_size;
        if let Some(declared) = declared_size {
            if declared > max {
                return Err(TroveError::FileTooLarge { limit: max });
            }
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("user {}", user_id)))?;
        if user.deleted_at.is_some() {
            return Err(TroveError::Forbidden("Account is scheduled for deletion".to_string()));
        }

        let expected = declared_size.unwrap_or(0).min(max);
        check_quota(expected, user.available_bytes() as u64)
    }

    async fn ingest<R>(
        &self,
        user_id: i64,
        row_id: i64,
        target: &Target,
        reader: R,
        cancel: &CancellationToken,
    ) -> TroveResult<FileRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.store
            .update_file_status(row_id, FileStatus::Uploading, None)
            .await?;

        // Stream into the spool; the guard removes it however we leave
        let (spool, mut file) = SpoolFile::create(&self.config.storage.temp_dir).await?;
        let limit = self.config.limits.max_upload_size;
        let mut hashing = HashingReader::new(BoundedReader::new(reader, limit));

        let copied = self
            .with_heartbeat(row_id, async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TroveError::Cancelled),
                    result = copy_buffered(&mut hashing, &mut file) => result.map_err(|e| {
                        match FileTooLarge::from_io(&e) {
                            Some(too_large) => TroveError::FileTooLarge { limit: too_large.limit },
                            None => TroveError::Io(e),
                        }
                    }),
                }
            })
            .await;
        drop(file);
        copied?;

        let size = hashing.bytes_read();
        let digest = hashing.final_sum();
        let size_i64 = size as i64;
        debug!("Spooled upload {}: {} bytes, sha256 {}", row_id, size, digest);

        let available = {
            let user = self
                .store
                .get_user(user_id)
                .await?
                .ok_or_else(|| TroveError::NotFound(format!("user {}", user_id)))?;
            user.available_bytes() as u64
        };

        // 4. Dedup lookup; a hit is only charged what the config says
        if self.config.limits.dedup_enabled {
            let scope = if self.config.limits.dedup_cross_user {
                None
            } else {
                Some(user_id)
            };

            if let Some(existing) = self.store.find_file_by_digest(scope, &digest).await? {
                let charge = if self.config.limits.dedup_hits_count_quota {
                    size_i64
                } else {
                    0
                };
                check_quota(charge as u64, available)?;

                let commit = UploadCommit {
                    storage_key: existing.storage_key.clone(),
                    size: size_i64,
                    digest: digest.clone(),
                    mime_type: target.mime_type.clone(),
                    quota_bytes: charge,
                    dedup_hit: true,
                };

                match self.store.commit_upload(row_id, &commit).await? {
                    CommitOutcome::Committed(file) => {
                        info!(
                            "✓ Upload {} deduplicated onto {} ({} bytes)",
                            file.id, existing.storage_key, size
                        );
                        return Ok(file);
                    }
                    CommitOutcome::KeyGone => {
                        debug!(
                            "Dedup source {} was purged before commit, storing a new copy",
                            existing.storage_key
                        );
                    }
                }
            }
        }

        // 5. Quota re-check with the real size
        check_quota(size, available)?;

        // 6. Register the key on the row, then hand the spool to the backend
        let key = new_storage_key(&target.original_name);
        self.store.assign_upload_key(row_id, &key).await?;

        let opts = SaveOptions {
            key: Some(key.clone()),
            original_name: target.original_name.clone(),
            content_type: Some(target.mime_type.clone()),
            expected_digest: Some(digest.clone()),
        };
        let saved = self
            .with_heartbeat(row_id, self.backend.save_spool(spool.path(), &opts, cancel))
            .await?;

        if saved.key != key || saved.digest != digest || saved.size != size {
            self.discard_blob(&saved.key).await;
            return Err(TroveError::Internal(format!(
                "backend stored {} bytes ({}) as {} for a {} byte upload ({}) keyed {}",
                saved.size, saved.digest, saved.key, size, digest, key
            )));
        }

        // 7. Commit record and quota together
        let commit = UploadCommit {
            storage_key: saved.key.clone(),
            size: size_i64,
            digest,
            mime_type: target.mime_type.clone(),
            quota_bytes: size_i64,
            dedup_hit: false,
        };

        match self.store.commit_upload(row_id, &commit).await {
            Ok(CommitOutcome::Committed(file)) => {
                info!(
                    "✓ Stored upload {} ({}/{}, {} bytes) as {}",
                    file.id, target.folder, target.display_name, size, saved.key
                );
                Ok(file)
            }
            Ok(CommitOutcome::KeyGone) => {
                self.discard_blob(&saved.key).await;
                Err(TroveError::Internal(format!(
                    "commit of upload {} reported a missing key for a fresh blob",
                    row_id
                )))
            }
            Err(e) => {
                // The row may already be gone, and its key with it
                self.discard_blob(&saved.key).await;
                Err(e)
            }
        }
    }

    /// Drive `work` while refreshing the row's `updated_at`
    async fn with_heartbeat<F, T>(&self, row_id: i64, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let period = heartbeat_interval(self.config.retention.failed_upload_retention);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.store.touch_upload(row_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Upload row {} vanished while streaming", row_id),
                    Err(e) => warn!("Failed to refresh upload row {}: {}", row_id, e),
                },
            }
        }
    }

    /// Delete a blob this upload stored but could not commit
    async fn discard_blob(&self, key: &str) {
        if let Err(e) = self.store.enqueue_blob_deletion(key).await {
            warn!("Failed to queue orphaned blob {}: {}", key, e);
        }

        match self.backend.delete(key, &CancellationToken::new()).await {
            Ok(()) => {
                if let Err(e) = self.store.dequeue_blob_deletion(key).await {
                    warn!("Failed to dequeue deleted blob {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to delete orphaned blob {}: {}", key, e),
        }
    }

    /// Drop the reserved row of a failed upload, or mark it failed
    ///
    /// A blob registered on the row goes with it.
    async fn abandon_row(&self, row_id: i64, cause: &TroveError) {
        match self.store.delete_upload_row(row_id).await {
            Ok(Some(row)) => {
                debug!("Removed row of failed upload {}: {}", row_id, cause);
                if !row.storage_key.is_empty() {
                    self.discard_blob(&row.storage_key).await;
                }
            }
            Ok(None) => debug!("Upload {} left no row to remove: {}", row_id, cause),
            Err(e) => {
                warn!("Failed to remove row of failed upload {}: {}", row_id, e);
                let message = cause.to_string();
                if let Err(e) = self
                    .store
                    .update_file_status(row_id, FileStatus::Failed, Some(&message))
                    .await
                {
                    warn!("Failed to mark upload {} as failed: {}", row_id, e);
                }
            }
        }
    }
}

fn check_quota(requested: u64, available: u64) -> TroveResult<()> {
    if requested > available {
        return Err(TroveError::QuotaExceeded {
            requested,
            available,
        });
    }
    Ok(())
}

/// Cleans up the row of an upload whose future was dropped mid-flight
///
/// Drop cannot await, so the cleanup runs as a detached task on the
/// current runtime.
struct AbandonOnDrop {
    pipeline: Option<UploadPipeline>,
    row_id: i64,
}

impl AbandonOnDrop {
    fn new(pipeline: UploadPipeline, row_id: i64) -> Self {
        Self {
            pipeline: Some(pipeline),
            row_id,
        }
    }

    fn disarm(&mut self) {
        self.pipeline = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        let row_id = self.row_id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Upload {} dropped mid-flight, cleaning up", row_id);
                handle.spawn(async move {
                    pipeline.abandon_row(row_id, &TroveError::Cancelled).await;
                });
            }
            Err(_) => warn!(
                "Upload {} dropped outside a runtime; leaving its row to the stale reaper",
                row_id
            ),
        }
    }
}
