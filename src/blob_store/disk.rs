/// Disk-based blob storage backend
use crate::{
    blob_store::{
        cancellable, BlobBackend, BlobError, BlobReader, BlobResult, BlobSource,
        BlobStat, SaveOptions, SavedBlob,
    },
    stream::{copy_buffered, HashingReader},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest key accepted by the disk backend
const MAX_KEY_LEN: usize = 255;

/// Disk storage backend
///
/// Blobs are plain files directly under a root directory that is created and
/// canonicalised once at start-up. Keys are single path components, so no key
/// can name anything outside the root; symlinks found under the root are
/// refused rather than followed.
#[derive(Clone, Debug)]
pub struct DiskBlobBackend {
    root: PathBuf,
}

impl DiskBlobBackend {
    /// Open (creating if needed) the storage root
    pub async fn open(location: &Path) -> BlobResult<Self> {
        fs::create_dir_all(location).await.map_err(|e| {
            BlobError::Unavailable(format!(
                "Failed to create storage root {}: {}",
                location.display(),
                e
            ))
        })?;

        let root = fs::canonicalize(location).await.map_err(|e| {
            BlobError::Unavailable(format!(
                "Failed to resolve storage root {}: {}",
                location.display(),
                e
            ))
        })?;

        let meta = fs::metadata(&root)
            .await
            .map_err(|e| BlobError::Unavailable(format!("{}: {}", root.display(), e)))?;
        if !meta.is_dir() {
            return Err(BlobError::Internal(format!(
                "Storage root {} is not a directory",
                root.display()
            )));
        }

        debug!("Disk blob storage rooted at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a key, after checking the key cannot leave the root
    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Path for a key that must exist as a regular file (not a symlink)
    async fn existing_blob(&self, key: &str) -> BlobResult<(PathBuf, std::fs::Metadata)> {
        let path = self.blob_path(key)?;
        let meta = fs::symlink_metadata(&path)
            .await
            .map_err(|e| BlobError::from_io(key, e))?;

        if meta.file_type().is_symlink() || !meta.is_file() {
            return Err(BlobError::Denied(format!("{} is not a regular file", key)));
        }

        Ok((path, meta))
    }
}

/// Accept only plain single-component names: `[A-Za-z0-9._-]`, no leading
/// dot, at most 255 bytes
pub(crate) fn validate_key(key: &str) -> BlobResult<()> {
    let well_formed = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if well_formed {
        Ok(())
    } else {
        Err(BlobError::Denied(format!("invalid storage key {:?}", key)))
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial blob {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl BlobBackend for DiskBlobBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn save(
        &self,
        reader: BlobSource<'_>,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        let key = opts.storage_key();
        let path = self.blob_path(&key)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| BlobError::from_io(&key, e))?;

        let mut hashing = HashingReader::new(reader);
        let written = cancellable(cancel, async {
            copy_buffered(&mut hashing, &mut file)
                .await
                .map_err(|e| BlobError::from_io(&key, e))?;
            file.sync_all()
                .await
                .map_err(|e| BlobError::from_io(&key, e))
        })
        .await;

        if let Err(e) = written {
            drop(file);
            remove_partial(&path).await;
            return Err(e);
        }

        Ok(SavedBlob {
            key,
            digest: hashing.final_sum(),
            size: hashing.bytes_read(),
        })
    }

    async fn save_spool(
        &self,
        spool: &Path,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        // Without a digest from upstream the bytes have to be read anyway
        if let Some(digest) = &opts.expected_digest {
            let key = opts.storage_key();
            let dest = self.blob_path(&key)?;
            let size = fs::metadata(spool)
                .await
                .map_err(|e| BlobError::Internal(format!("stat spool {}: {}", spool.display(), e)))?
                .len();

            match fs::rename(spool, &dest).await {
                Ok(()) => {
                    debug!("Moved spool {} to {}", spool.display(), key);
                    return Ok(SavedBlob {
                        key,
                        digest: digest.clone(),
                        size,
                    });
                }
                Err(e) => debug!(
                    "Rename of {} into storage root failed ({}), copying instead",
                    spool.display(),
                    e
                ),
            }
        }

        let mut file = fs::File::open(spool)
            .await
            .map_err(|e| BlobError::Internal(format!("open spool {}: {}", spool.display(), e)))?;
        self.save(&mut file, opts, cancel).await
    }

    async fn open(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobReader> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        let (path, _) = self.existing_blob(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| BlobError::from_io(key, e))?;

        Ok(Box::pin(file))
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BlobResult<()> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::from_io(key, e)),
        }
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobStat> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        let (_, meta) = self.existing_blob(key).await?;
        let modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(BlobStat {
            key: key.to_string(),
            size: meta.len(),
            modified_at,
        })
    }

    async fn health(&self, cancel: &CancellationToken) -> BlobResult<()> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BlobError::Unavailable(format!(
                "{} is no longer a directory",
                self.root.display()
            ))),
            Err(e) => Err(BlobError::Unavailable(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }
}
