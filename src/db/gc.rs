/// Outstanding blob deletions
///
/// A key is queued before its blob is deleted and dequeued afterwards, so a
/// crash or a backend outage in between leaves a record for the GC job to
/// retry.
use crate::db::{now, GcEntry, MetadataStore};
use crate::error::TroveResult;
use sqlx::AnyConnection;

impl MetadataStore {
    /// Queue `storage_key` on `conn` when no record uses it any more
    ///
    /// Meant for the transaction that drops the last reference, so the
    /// queue entry commits together with the delete.
    pub async fn queue_if_unreferenced(
        conn: &mut AnyConnection,
        storage_key: &str,
    ) -> TroveResult<bool> {
        if storage_key.is_empty() {
            return Ok(false);
        }

        let retained: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_path = $1")
            .bind(storage_key)
            .fetch_one(&mut *conn)
            .await?;
        if retained > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO blob_gc (storage_key, queued_at, attempts) VALUES ($1, $2, 0) \
             ON CONFLICT (storage_key) DO NOTHING",
        )
        .bind(storage_key)
        .bind(now())
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }

    /// Queue a key; queuing it twice is a no-op
    pub async fn enqueue_blob_deletion(&self, storage_key: &str) -> TroveResult<()> {
        sqlx::query(
            "INSERT INTO blob_gc (storage_key, queued_at, attempts) VALUES ($1, $2, 0) \
             ON CONFLICT (storage_key) DO NOTHING",
        )
        .bind(storage_key)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn dequeue_blob_deletion(&self, storage_key: &str) -> TroveResult<()> {
        sqlx::query("DELETE FROM blob_gc WHERE storage_key = $1")
            .bind(storage_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_blob_deletion_failure(
        &self,
        storage_key: &str,
        error: &str,
    ) -> TroveResult<()> {
        sqlx::query(
            "UPDATE blob_gc SET attempts = attempts + 1, last_error = $1 WHERE storage_key = $2",
        )
        .bind(error)
        .bind(storage_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest entries first
    pub async fn pending_blob_deletions(&self, limit: i64) -> TroveResult<Vec<GcEntry>> {
        let entries = sqlx::query_as::<_, GcEntry>(
            "SELECT storage_key, queued_at, attempts, last_error FROM blob_gc \
             ORDER BY queued_at, storage_key LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_roundtrip() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.enqueue_blob_deletion("a").await.unwrap();
        store.enqueue_blob_deletion("a").await.unwrap();
        store.enqueue_blob_deletion("b").await.unwrap();

        store.record_blob_deletion_failure("a", "backend down").await.unwrap();

        let entries = store.pending_blob_deletions(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|e| e.storage_key == "a").unwrap();
        assert_eq!(a.attempts, 1);
        assert_eq!(a.last_error.as_deref(), Some("backend down"));

        store.dequeue_blob_deletion("a").await.unwrap();
        store.dequeue_blob_deletion("b").await.unwrap();
        assert!(store.pending_blob_deletions(10).await.unwrap().is_empty());
    }
}
