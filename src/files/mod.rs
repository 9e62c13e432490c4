/// File access, deletion and garbage collection
///
/// A file record points at a blob through its storage key, and several
/// records may share one key. Purging a record never deletes a blob that
/// another record (live or soft-deleted) still holds; when the last holder
/// goes, the key is queued in `blob_gc` first and dequeued once the backend
/// confirms the delete, so an interrupted delete is retried by the sweep.
pub mod folders;

use crate::blob_store::{BlobBackend, BlobReader};
use crate::config::ServerConfig;
use crate::db::{now, FileRecord, MetadataStore};
use crate::error::{TroveError, TroveResult};
use folders::normalize_path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest allowed display name, in characters
const MAX_NAME_CHARS: usize = 255;

/// Names tried when restoring into an occupied slot
const MAX_RESTORE_ATTEMPTS: u32 = 100;

/// Records handled per batch by the sweeps
const SWEEP_BATCH: i64 = 100;

/// `name` for attempt 0, then `name (1).ext`, `name (2).ext`, ...
pub fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, attempt, ext),
        _ => format!("{} ({})", name, attempt),
    }
}

/// Validate a user-supplied file name
///
/// Browsers may send a full client path; only the last component is kept.
pub fn clean_file_name(raw: &str) -> TroveResult<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(TroveError::Validation("File name is required".to_string()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(TroveError::Validation(format!(
            "File name exceeds {} characters",
            MAX_NAME_CHARS
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TroveError::Validation(
            "File names cannot contain control characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// `Content-Disposition` value with an ASCII fallback and an RFC 5987 name
pub fn content_disposition_value(filename: &str) -> String {
    let ascii_safe: String = filename
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && !matches!(c, '"' | ';' | '\\'))
        .collect();
    let ascii_name = match ascii_safe.trim() {
        "" => "download".to_string(),
        name => name.to_string(),
    };

    let encoded: String = filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'&'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~' => String::from(b as char),
            _ => format!("%{:02X}", b),
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_name, encoded
    )
}

/// An opened download: the record plus a streaming reader over its blob
pub struct Download {
    pub file: FileRecord,
    pub reader: BlobReader,
}

/// Outcome of one sweep run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: u64,
    pub failed: u64,
}

/// File operations shared by the API and the background jobs
#[derive(Clone)]
pub struct FileService {
    store: MetadataStore,
    backend: Arc<dyn BlobBackend>,
    config: Arc<ServerConfig>,
}

impl FileService {
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

    /// Load a record owned by `user_id`
    ///
    /// Someone else's record is `Denied`, which the API reports as 404.
    async fn owned(&self, user_id: i64, id: i64) -> TroveResult<FileRecord> {
        let file = self
            .store
            .get_file(id)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("file {}", id)))?;

        if file.user_id != user_id {
            return Err(TroveError::Denied(format!(
                "file {} does not belong to user {}",
                id, user_id
            )));
        }
        Ok(file)
    }

    pub async fn get(&self, user_id: i64, id: i64) -> TroveResult<FileRecord> {
        let file = self.owned(user_id, id).await?;
        if !file.is_live() {
            return Err(TroveError::NotFound(format!("file {}", id)));
        }
        Ok(file)
    }

    /// Live files in a folder
    pub async fn list(&self, user_id: i64, folder: &str) -> TroveResult<Vec<FileRecord>> {
        let folder = normalize_path(folder)?;
        self.store.list_files(user_id, &folder).await
    }

    /// Soft-deleted files awaiting purge
    pub async fn list_deleted(&self, user_id: i64) -> TroveResult<Vec<FileRecord>> {
        self.store.list_deleted_files(user_id).await
    }

    /// Open a live file for streaming
    pub async fn open_download(
        &self,
        user_id: i64,
        id: i64,
        cancel: &CancellationToken,
    ) -> TroveResult<Download> {
        let file = self.get(user_id, id).await?;
        let reader = self.backend.open(&file.storage_key, cancel).await?;
        debug!("Opened file {} (key {}) for download", file.id, file.storage_key);
        Ok(Download { file, reader })
    }

    pub async fn rename(&self, user_id: i64, id: i64, new_name: &str) -> TroveResult<FileRecord> {
        let name = clean_file_name(new_name)?;
        let file = self.get(user_id, id).await?;
        self.store.rename_file(file.id, &name).await
    }

    /// Move a file to the trash
    ///
    /// The blob is untouched. Its bytes keep counting against the owner's
    /// quota unless deleted files are configured not to.
    pub async fn soft_delete(&self, user_id: i64, id: i64) -> TroveResult<FileRecord> {
        let file = self.owned(user_id, id).await?;
        let release = !self.config.retention.deleted_counts_quota;

        let deleted = self
            .store
            .delete_file(file.id, release)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("file {}", id)))?;

        info!("Soft deleted file {} for user {}", deleted.id, user_id);
        Ok(deleted)
    }

    /// Bring a file back from the trash into its original folder
    ///
    /// The folder is recreated if it was removed meanwhile, and a name taken
    /// in the meantime gets a numbered variant. A record whose bytes were
    /// released at deletion is charged its full size again.
    pub async fn restore(&self, user_id: i64, id: i64) -> TroveResult<FileRecord> {
        let file = self.owned(user_id, id).await?;
        if !file.is_deleted() {
            return Err(TroveError::Conflict(format!("file {} is not deleted", id)));
        }

        let folder = file
            .original_path
            .as_deref()
            .and_then(|p| normalize_path(p).ok())
            .unwrap_or_else(|| "/".to_string());
        let reacquire = if file.quota_bytes == 0 { file.size } else { 0 };

        for attempt in 0..MAX_RESTORE_ATTEMPTS {
            let name = numbered_name(&file.display_name, attempt);
            match self.store.restore_file(file.id, &folder, &name, reacquire).await {
                Ok(restored) => {
                    info!(
                        "Restored file {} to {} as {:?}",
                        restored.id, restored.logical_path, restored.display_name
                    );
                    return Ok(restored);
                }
                Err(TroveError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TroveError::Conflict(format!(
            "No free name to restore {} into {}",
            file.display_name, folder
        )))
    }

    /// Purge one of the caller's files right away
    pub async fn purge(&self, user_id: i64, id: i64) -> TroveResult<()> {
        let file = self.owned(user_id, id).await?;
        self.purge_file(file.id).await?;
        Ok(())
    }

    /// Hard delete a record and reclaim its blob if nothing else holds it
    ///
    /// Purging an id that is already gone returns `None`. Blob cleanup
    /// failures are logged and left to the GC queue.
    pub async fn purge_file(&self, id: i64) -> TroveResult<Option<FileRecord>> {
        let Some(file) = self.store.purge_file(id).await? else {
            debug!("File {} already purged", id);
            return Ok(None);
        };

        if let Err(e) = self.release_blob(&file.storage_key).await {
            warn!(
                "Blob cleanup for {} after purging file {} failed: {}",
                file.storage_key, id, e
            );
        }

        debug!("Purged file {}", id);
        Ok(Some(file))
    }

    /// Delete the blob behind `key` once no record references it
    ///
    /// Returns whether the blob was deleted.
    async fn release_blob(&self, key: &str) -> TroveResult<bool> {
        if key.is_empty() {
            return Ok(false);
        }

        if self.store.count_retained_references(key).await? > 0 {
            return Ok(false);
        }

        self.store.enqueue_blob_deletion(key).await?;
        self.delete_queued_blob(key).await
    }

    async fn delete_queued_blob(&self, key: &str) -> TroveResult<bool> {
        match self.backend.delete(key, &CancellationToken::new()).await {
            Ok(()) => {
                self.store.dequeue_blob_deletion(key).await?;
                debug!("Deleted blob {}", key);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to delete blob {}: {}", key, e);
                self.store
                    .record_blob_deletion_failure(key, &e.to_string())
                    .await?;
                Ok(false)
            }
        }
    }

    /// Purge soft-deleted records whose retention window has passed
    ///
    /// Safe to re-run after a partial failure; anything not purged now is
    /// picked up next time.
    pub async fn sweep_expired(&self, now: i64) -> TroveResult<SweepReport> {
        let mut report = SweepReport::default();
        let default_days = self.config.retention.deleted_retention_days;

        loop {
            let batch = self
                .store
                .expired_deleted_files(now, default_days, SWEEP_BATCH)
                .await?;
            let batch_len = batch.len() as i64;
            let mut purged_in_batch = 0;

            for file in batch {
                match self.purge_file(file.id).await {
                    Ok(_) => {
                        report.purged += 1;
                        purged_in_batch += 1;
                    }
                    Err(e) => {
                        warn!("Failed to purge expired file {}: {}", file.id, e);
                        report.failed += 1;
                    }
                }
            }

            // A short batch is the last one; a batch with no progress would repeat forever
            if batch_len < SWEEP_BATCH || purged_in_batch == 0 {
                break;
            }
        }

        if report.purged > 0 || report.failed > 0 {
            info!(
                "Retention sweep purged {} files ({} failed)",
                report.purged, report.failed
            );
        }
        Ok(report)
    }

    /// Retry outstanding blob deletions
    pub async fn drain_gc_queue(&self) -> TroveResult<SweepReport> {
        let mut report = SweepReport::default();

        for entry in self.store.pending_blob_deletions(SWEEP_BATCH).await? {
            if self.store.count_retained_references(&entry.storage_key).await? > 0 {
                // Referenced again; not ours to delete
                self.store.dequeue_blob_deletion(&entry.storage_key).await?;
                continue;
            }

            if self.delete_queued_blob(&entry.storage_key).await? {
                report.purged += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.purged > 0 || report.failed > 0 {
            info!(
                "GC queue: deleted {} blobs ({} still failing)",
                report.purged, report.failed
            );
        }
        Ok(report)
    }

    /// Remove upload rows that never completed
    ///
    /// Rows untouched for longer than the failed-upload retention are purged,
    /// along with any blob key registered on them. Live uploads refresh their
    /// row well inside that window.
    pub async fn reap_stale_uploads(&self) -> TroveResult<u64> {
        let retention = self.config.retention.failed_upload_retention.as_secs() as i64;
        let cutoff = now() - retention;
        let mut reaped = 0;

        for file in self.store.stale_uploads(cutoff, SWEEP_BATCH).await? {
            match self.purge_file(file.id).await {
                Ok(Some(_)) => reaped += 1,
                Ok(None) => {}
                Err(e) => warn!("Failed to reap stale upload {}: {}", file.id, e),
            }
        }

        if reaped > 0 {
            info!("Reaped {} stale upload records", reaped);
        }
        Ok(reaped)
    }

    /// Purge every record of a user; returns how many were removed
    pub async fn purge_user_files(&self, user_id: i64) -> TroveResult<u64> {
        let mut purged = 0;
        for id in self.store.user_file_ids(user_id).await? {
            if self.purge_file(id).await?.is_some() {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("a.txt", 0), "a.txt");
        assert_eq!(numbered_name("a.txt", 2), "a (2).txt");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc (1)");
        assert_eq!(numbered_name("backup.tar.gz", 1), "backup.tar (1).gz");
    }

    #[test]
    fn test_clean_file_name() {
        assert_eq!(clean_file_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(clean_file_name("C:\\fakepath\\photo.jpg").unwrap(), "photo.jpg");
        assert_eq!(clean_file_name("../../etc/passwd").unwrap(), "passwd");
        assert!(clean_file_name("").is_err());
        assert!(clean_file_name("dir/").is_err());
        assert!(clean_file_name("..").is_err());
        assert!(clean_file_name("bad\nname").is_err());
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition_value("hello.txt"),
            "attachment; filename=\"hello.txt\"; filename*=UTF-8''hello.txt"
        );
        assert_eq!(
            content_disposition_value("my \"best\" file.txt"),
            "attachment; filename=\"my best file.txt\"; filename*=UTF-8''my%20%22best%22%20file.txt"
        );
        assert_eq!(
            content_disposition_value("résumé.pdf"),
            "attachment; filename=\"rsum.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
        );
        assert!(content_disposition_value("日本").starts_with("attachment; filename=\"download\""));
    }
}
