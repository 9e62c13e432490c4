/// Blob Storage System
///
/// Stores the raw bytes of uploads under opaque, backend-assigned keys.
/// Supports multiple backend implementations (disk, memory, S3). The upload
/// pipeline only ever sees streams, keys, sizes and digests; no backend
/// specific type leaks through this trait.

pub mod disk;
pub mod error;
pub mod memory;
pub mod s3;

pub use disk::DiskBlobBackend;
pub use error::{BlobError, BlobResult};
pub use memory::MemoryBlobBackend;
pub use s3::{S3BlobBackend, S3Config};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Readable blob body handed out by `open`
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Upload source accepted by `save`
pub type BlobSource<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Options passed to `save`
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Key to store under; a fresh one is derived from the name when unset
    pub key: Option<String>,

    /// Name as uploaded; only used to derive the key extension
    pub original_name: String,

    /// MIME hint for backends that store one
    pub content_type: Option<String>,

    /// Digest already computed upstream, for saves that move bytes without
    /// reading them
    pub expected_digest: Option<String>,
}

impl SaveOptions {
    /// The key a save with these options writes to
    pub fn storage_key(&self) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| new_storage_key(&self.original_name))
    }
}

/// Result of a successful `save`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBlob {
    pub key: String,
    pub digest: String,
    pub size: u64,
}

/// Result of `stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStat {
    pub key: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Blob storage backend trait
///
/// Every operation takes a cancellation token; a fired token makes the
/// operation return `BlobError::Cancelled` without leaving partial state.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Consume `reader` to EOF and persist it under `opts.storage_key()`
    async fn save(
        &self,
        reader: BlobSource<'_>,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob>;

    /// Persist a finished scratch file
    ///
    /// The file may be moved rather than copied, so callers must not rely on
    /// it existing afterwards.
    async fn save_spool(
        &self,
        path: &Path,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BlobError::Internal(format!("open spool {}: {}", path.display(), e)))?;
        self.save(&mut file, opts, cancel).await
    }

    /// Open a blob for streaming
    async fn open(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobReader>;

    /// Delete a blob; deleting a missing key succeeds
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BlobResult<()>;

    /// Size and modification time of a blob
    async fn stat(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobStat>;

    /// Cheap liveness probe
    async fn health(&self, cancel: &CancellationToken) -> BlobResult<()>;

    /// Write, read back and delete a temporary blob
    async fn validate_access(&self, cancel: &CancellationToken) -> BlobResult<()> {
        let probe = b"trove access probe";
        let opts = SaveOptions {
            original_name: "access-probe.tmp".to_string(),
            ..Default::default()
        };

        let mut source: &[u8] = probe;
        let saved = self.save(&mut source, &opts, cancel).await?;

        let round_trip = async {
            let mut reader = self.open(&saved.key, cancel).await?;
            let mut read_back = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut read_back)
                .await
                .map_err(|e| BlobError::from_io(&saved.key, e))?;

            if read_back != probe {
                return Err(BlobError::Internal(format!(
                    "{} backend returned different bytes for probe {}",
                    self.name(),
                    saved.key
                )));
            }
            Ok(())
        }
        .await;

        // Remove the probe whatever the round trip said
        let cleanup = self.delete(&saved.key, &CancellationToken::new()).await;
        round_trip?;
        cleanup
    }
}

/// Backend types for blob storage
#[derive(Debug, Clone)]
pub enum BlobBackendType {
    /// Store blobs on local disk
    Disk { location: PathBuf },

    /// Keep blobs in process memory (tests, throwaway deployments)
    Memory,

    /// Store blobs in S3-compatible storage
    S3(S3Config),
}

impl BlobBackendType {
    pub fn name(&self) -> &'static str {
        match self {
            BlobBackendType::Disk { .. } => "disk",
            BlobBackendType::Memory => "memory",
            BlobBackendType::S3(_) => "s3",
        }
    }
}

/// Construct the configured backend
pub async fn connect(backend: &BlobBackendType) -> BlobResult<Arc<dyn BlobBackend>> {
    let backend: Arc<dyn BlobBackend> = match backend {
        BlobBackendType::Disk { location } => Arc::new(DiskBlobBackend::open(location).await?),
        BlobBackendType::Memory => Arc::new(MemoryBlobBackend::new()),
        BlobBackendType::S3(config) => Arc::new(S3BlobBackend::new(config.clone()).await?),
    };
    Ok(backend)
}

/// Fresh storage key: `<uuid>[.<ext>]`
///
/// The extension comes from the original file name, lower-cased, and is
/// dropped unless it is 1 to 16 ASCII alphanumerics.
pub fn new_storage_key(original_name: &str) -> String {
    let id = Uuid::new_v4();
    match key_extension(original_name) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    }
}

fn key_extension(original_name: &str) -> Option<String> {
    let base = original_name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 16 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> BlobResult<T>
where
    F: Future<Output = BlobResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BlobError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_options_honour_a_given_key() {
        let opts = SaveOptions {
            key: Some("chosen.bin".to_string()),
            original_name: "other.txt".to_string(),
            ..Default::default()
        };
        assert_eq!(opts.storage_key(), "chosen.bin");

        let fresh = SaveOptions {
            original_name: "other.txt".to_string(),
            ..Default::default()
        };
        assert!(fresh.storage_key().ends_with(".txt"));
        assert_ne!(fresh.storage_key(), fresh.storage_key());
    }

    #[test]
    fn test_key_keeps_simple_extension() {
        let key = new_storage_key("Holiday Photo.JPG");
        assert!(key.ends_with(".jpg"));
        assert!(Uuid::parse_str(key.trim_end_matches(".jpg")).is_ok());
    }

    #[test]
    fn test_key_drops_odd_extensions() {
        for name in [
            "README",
            ".bashrc",
            "archive.tar.g z",
            "weird.ext-with-dash",
            "x.abcdefghijklmnopq",
            "trailing.",
        ] {
            let key = new_storage_key(name);
            assert!(Uuid::parse_str(&key).is_ok(), "{} -> {}", name, key);
        }
    }

    #[test]
    fn test_key_ignores_directories_in_name() {
        assert_eq!(key_extension("../../etc/passwd"), None);
        assert_eq!(key_extension("dir.d/file.txt"), Some("txt".into()));
        assert_eq!(key_extension(r"C:\Users\me\notes.MD"), Some("md".into()));
    }

    #[test]
    fn test_keys_are_unique() {
        let a = new_storage_key("a.txt");
        let b = new_storage_key("a.txt");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: BlobResult<()> = cancellable(&cancel, std::future::pending()).await;
        assert_eq!(res, Err(BlobError::Cancelled));
    }
}
