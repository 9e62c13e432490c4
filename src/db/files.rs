/// File records
///
/// Statements that open a transaction write first. SQLite upgrades a read
/// transaction to a write one only if nobody else wrote in between, so
/// leading with the write keeps concurrent uploads from failing with BUSY.
use crate::db::{
    now, CommitOutcome, FileRecord, FileStatus, MetadataStore, NewFile, UploadCommit,
    FILE_COLUMNS,
};
use crate::error::{is_unique_violation, TroveError, TroveResult};
use crate::files::numbered_name;
use sqlx::{AnyConnection, Row};
use tracing::debug;

/// Names tried before a reservation gives up
const MAX_NAME_ATTEMPTS: u32 = 100;

/// `FILE_COLUMNS` qualified with a table alias
fn file_columns_as(alias: &str) -> String {
    FILE_COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl MetadataStore {
    /// Insert a file record inside the caller's transaction
    pub async fn insert_file(conn: &mut AnyConnection, file: &NewFile) -> TroveResult<i64> {
        let ts = now();
        let row = sqlx::query(
            "INSERT INTO files (user_id, storage_path, logical_path, display_name, original_name, \
             size, mime_type, digest, status, quota_bytes, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING id",
        )
        .bind(file.user_id)
        .bind(&file.storage_key)
        .bind(&file.logical_path)
        .bind(&file.display_name)
        .bind(&file.original_name)
        .bind(file.size)
        .bind(&file.mime_type)
        .bind(&file.digest)
        .bind(file.status.as_str())
        .bind(file.quota_bytes)
        .bind(ts)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Insert a `pending` row that reserves a display name in a folder
    ///
    /// On a name clash the next free `name (n).ext` is taken instead.
    pub async fn reserve_upload(
        &self,
        user_id: i64,
        logical_path: &str,
        display_name: &str,
        original_name: &str,
        mime_type: &str,
    ) -> TroveResult<FileRecord> {
        let mut conn = self.pool.acquire().await?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = numbered_name(display_name, attempt);
            let pending = NewFile {
                user_id,
                storage_key: String::new(),
                logical_path: logical_path.to_string(),
                display_name: name.clone(),
                original_name: original_name.to_string(),
                size: 0,
                mime_type: mime_type.to_string(),
                digest: String::new(),
                status: FileStatus::Pending,
                quota_bytes: 0,
            };

            match Self::insert_file(&mut conn, &pending).await {
                Ok(id) => {
                    drop(conn);
                    return self
                        .get_file(id)
                        .await?
                        .ok_or_else(|| TroveError::Internal(format!("file {} vanished", id)));
                }
                Err(TroveError::Database(e)) if is_unique_violation(&e) => {
                    debug!("Name {:?} taken in {}, trying next", name, logical_path);
                }
                Err(e) => return Err(e),
            }
        }

        Err(TroveError::Conflict(format!(
            "No free name for {} in {}",
            display_name, logical_path
        )))
    }

    pub async fn get_file(&self, id: i64) -> TroveResult<Option<FileRecord>> {
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE id = $1",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    /// A live, completed record with this digest
    ///
    /// `user_id = None` searches every user.
    pub async fn find_file_by_digest(
        &self,
        user_id: Option<i64>,
        digest: &str,
    ) -> TroveResult<Option<FileRecord>> {
        let base = format!(
            "SELECT {} FROM files WHERE digest = $1 AND status = 'completed' \
             AND deleted_at IS NULL AND storage_path <> ''",
            FILE_COLUMNS
        );

        let file = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "{} AND user_id = $2 ORDER BY id LIMIT 1",
                    base
                ))
                .bind(digest)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, FileRecord>(&format!("{} ORDER BY id LIMIT 1", base))
                    .bind(digest)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(file)
    }

    pub async fn update_file_status(
        &self,
        id: i64,
        status: FileStatus,
        error_message: Option<&str>,
    ) -> TroveResult<()> {
        sqlx::query("UPDATE files SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4")
            .bind(status.as_str())
            .bind(error_message)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the storage key an upload is about to write
    ///
    /// From here on the row retains the key, so a crashed upload leaves a
    /// row whose purge queues the blob instead of an untracked object.
    pub async fn assign_upload_key(&self, id: i64, storage_key: &str) -> TroveResult<()> {
        let result = sqlx::query(
            "UPDATE files SET storage_path = $1, updated_at = $2 \
             WHERE id = $3 AND status = 'uploading'",
        )
        .bind(storage_key)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TroveError::NotFound(format!("upload {} is no longer in progress", id)));
        }
        Ok(())
    }

    /// Keep an in-flight upload row out of the stale reaper's reach
    pub async fn touch_upload(&self, id: i64) -> TroveResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET updated_at = $1 WHERE id = $2 AND status IN ('pending', 'uploading')",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop a row that never completed; it holds no quota
    ///
    /// A storage key already registered on the row is queued for deletion
    /// in the same transaction. Returns the removed row.
    pub async fn delete_upload_row(&self, id: i64) -> TroveResult<Option<FileRecord>> {
        let mut tx = self.pool.begin().await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "DELETE FROM files WHERE id = $1 AND status <> 'completed' RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(file) = file else {
            return Ok(None);
        };

        Self::queue_if_unreferenced(&mut tx, &file.storage_key).await?;
        tx.commit().await?;
        Ok(Some(file))
    }

    /// Complete a reserved upload row and charge its quota in one transaction
    ///
    /// For a dedup hit the storage key must still be held by a completed
    /// record when the transaction runs; otherwise nothing is written and
    /// `KeyGone` tells the caller to store its own copy.
    pub async fn commit_upload(&self, id: i64, commit: &UploadCommit) -> TroveResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;
        let ts = now();

        let touched = sqlx::query(
            "UPDATE files SET updated_at = $1 WHERE id = $2 AND status = 'uploading'",
        )
        .bind(ts)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(TroveError::NotFound(format!("upload {} is no longer in progress", id)));
        }

        let user_id: i64 = sqlx::query_scalar("SELECT user_id FROM files WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        Self::adjust_user_used_bytes(&mut tx, user_id, commit.quota_bytes).await?;

        if commit.dedup_hit {
            let holder: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT id FROM files WHERE storage_path = $1 AND status = 'completed' \
                 AND id <> $2 LIMIT 1{}",
                self.dialect.for_update()
            ))
            .bind(&commit.storage_key)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if holder.is_none() {
                tx.rollback().await?;
                return Ok(CommitOutcome::KeyGone);
            }
        }

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET status = 'completed', storage_path = $1, size = $2, digest = $3, \
             mime_type = $4, quota_bytes = $5, error_message = NULL, updated_at = $6 \
             WHERE id = $7 RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(&commit.storage_key)
        .bind(commit.size)
        .bind(&commit.digest)
        .bind(&commit.mime_type)
        .bind(commit.quota_bytes)
        .bind(ts)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed(file))
    }

    /// Live files in one folder, by name
    pub async fn list_files(&self, user_id: i64, logical_path: &str) -> TroveResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE user_id = $1 AND logical_path = $2 \
             AND status = 'completed' AND deleted_at IS NULL ORDER BY display_name",
            FILE_COLUMNS
        ))
        .bind(user_id)
        .bind(logical_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Soft-deleted files of a user, newest first
    pub async fn list_deleted_files(&self, user_id: i64) -> TroveResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE user_id = $1 AND deleted_at IS NOT NULL \
             ORDER BY deleted_at DESC, id DESC",
            FILE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Every record id of a user, whatever its state
    pub async fn user_file_ids(&self, user_id: i64) -> TroveResult<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM files WHERE user_id = $1 ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Change the display name of a live file; clashes are `Conflict`
    pub async fn rename_file(&self, id: i64, display_name: &str) -> TroveResult<FileRecord> {
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET display_name = $1, updated_at = $2 \
             WHERE id = $3 AND status = 'completed' AND deleted_at IS NULL RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(display_name)
        .bind(now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            TroveError::conflict_on_unique(e, format!("A file named {} already exists", display_name))
        })?;

        file.ok_or_else(|| TroveError::NotFound(format!("file {}", id)))
    }

    /// Soft delete: tombstone the record and snapshot its folder
    ///
    /// With `release_quota` the record's bytes are handed back to its owner
    /// now instead of at purge. Returns `None` when there is no live,
    /// completed record with this id.
    pub async fn delete_file(&self, id: i64, release_quota: bool) -> TroveResult<Option<FileRecord>> {
        let mut tx = self.pool.begin().await?;
        let ts = now();

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET deleted_at = $1, original_path = logical_path, updated_at = $1 \
             WHERE id = $2 AND deleted_at IS NULL AND status = 'completed' RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(ts)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut file) = file else {
            return Ok(None);
        };

        if release_quota && file.quota_bytes > 0 {
            Self::adjust_user_used_bytes(&mut tx, file.user_id, -file.quota_bytes).await?;
            sqlx::query("UPDATE files SET quota_bytes = 0 WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            file.quota_bytes = 0;
        }

        tx.commit().await?;
        Ok(Some(file))
    }

    /// Undo a soft delete, placing the record at `logical_path / display_name`
    ///
    /// `reacquire` bytes are charged back to the owner (quota permitting).
    /// A name clash surfaces as `Conflict` so the caller can pick another.
    pub async fn restore_file(
        &self,
        id: i64,
        logical_path: &str,
        display_name: &str,
        reacquire: i64,
    ) -> TroveResult<FileRecord> {
        let mut tx = self.pool.begin().await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET deleted_at = NULL, original_path = NULL, logical_path = $1, \
             display_name = $2, quota_bytes = quota_bytes + $3, updated_at = $4 \
             WHERE id = $5 AND deleted_at IS NOT NULL RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(logical_path)
        .bind(display_name)
        .bind(reacquire)
        .bind(now())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            TroveError::conflict_on_unique(e, format!("A file named {} already exists", display_name))
        })?
        .ok_or_else(|| TroveError::NotFound(format!("deleted file {}", id)))?;

        Self::ensure_folder_in(&mut tx, file.user_id, logical_path).await?;
        Self::adjust_user_used_bytes(&mut tx, file.user_id, reacquire).await?;

        tx.commit().await?;
        Ok(file)
    }

    /// Hard delete a record and release its quota
    ///
    /// Returns the removed record, or `None` if it was already gone. When
    /// this was the last record using the blob, its key is queued for
    /// deletion before the transaction commits; the caller deletes the blob.
    pub async fn purge_file(&self, id: i64) -> TroveResult<Option<FileRecord>> {
        let mut tx = self.pool.begin().await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "DELETE FROM files WHERE id = $1 RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(file) = file else {
            return Ok(None);
        };

        Self::adjust_user_used_bytes(&mut tx, file.user_id, -file.quota_bytes).await?;
        Self::queue_if_unreferenced(&mut tx, &file.storage_key).await?;
        tx.commit().await?;
        Ok(Some(file))
    }

    /// Live references: completed, not soft-deleted records using `key`
    pub async fn count_references_to_key(&self, key: &str) -> TroveResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE storage_path = $1 \
             AND status = 'completed' AND deleted_at IS NULL",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Every record using `key`, including soft-deleted ones
    ///
    /// The blob may only be deleted when this is zero.
    pub async fn count_retained_references(&self, key: &str) -> TroveResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_path = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Soft-deleted records past their owner's retention window
    pub async fn expired_deleted_files(
        &self,
        now: i64,
        default_retention_days: i64,
        limit: i64,
    ) -> TroveResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files f JOIN users u ON u.id = f.user_id \
             WHERE f.deleted_at IS NOT NULL \
             AND f.deleted_at <= $1 - COALESCE(u.retention_days, $2) * 86400 \
             ORDER BY f.deleted_at, f.id LIMIT $3",
            file_columns_as("f")
        ))
        .bind(now)
        .bind(default_retention_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Upload rows that never completed and were last touched before `cutoff`
    pub async fn stale_uploads(&self, cutoff: i64, limit: i64) -> TroveResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE status IN ('pending', 'uploading', 'failed') \
             AND updated_at < $1 ORDER BY updated_at, id LIMIT $2",
            FILE_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Whether a live (or in-flight) record already uses this name
    pub async fn live_name_taken(
        &self,
        user_id: i64,
        logical_path: &str,
        display_name: &str,
    ) -> TroveResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE user_id = $1 AND logical_path = $2 \
             AND display_name = $3 AND deleted_at IS NULL AND status <> 'failed'",
        )
        .bind(user_id)
        .bind(logical_path)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Sum of `quota_bytes` over a user's records
    pub async fn charged_bytes(&self, user_id: i64) -> TroveResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT CAST(COALESCE(SUM(quota_bytes), 0) AS BIGINT) FROM files WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}
