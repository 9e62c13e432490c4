/// In-memory blob storage backend
///
/// Blobs live in a map guarded by a reader/writer lock. Nothing is durable;
/// this backend exists for tests and throwaway deployments.
use crate::blob_store::{
    cancellable, BlobBackend, BlobError, BlobReader, BlobResult, BlobSource,
    BlobStat, SaveOptions, SavedBlob,
};
use crate::stream::HashingReader;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct StoredBlob {
    data: Bytes,
    modified_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct MemoryBlobBackend {
    blobs: Arc<RwLock<HashMap<String, StoredBlob>>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Keys of every stored blob, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(
        &self,
        reader: BlobSource<'_>,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        let key = opts.storage_key();
        let mut hashing = HashingReader::new(reader);

        let data = cancellable(cancel, async {
            let mut data = Vec::new();
            hashing
                .read_to_end(&mut data)
                .await
                .map_err(|e| BlobError::from_io(&key, e))?;
            Ok(data)
        })
        .await?;

        let saved = SavedBlob {
            key: key.clone(),
            digest: hashing.final_sum(),
            size: hashing.bytes_read(),
        };

        self.blobs.write().await.insert(
            key,
            StoredBlob {
                data: Bytes::from(data),
                modified_at: Utc::now(),
            },
        );

        Ok(saved)
    }

    async fn open(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobReader> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(key)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))?;

        Ok(Box::pin(Cursor::new(blob.data.clone())))
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BlobResult<()> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobStat> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }

        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(key)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))?;

        Ok(BlobStat {
            key: key.to_string(),
            size: blob.data.len() as u64,
            modified_at: blob.modified_at,
        })
    }

    async fn health(&self, _cancel: &CancellationToken) -> BlobResult<()> {
        Ok(())
    }

    async fn validate_access(&self, _cancel: &CancellationToken) -> BlobResult<()> {
        Ok(())
    }
}
