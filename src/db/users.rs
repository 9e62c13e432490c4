/// User accounts and storage accounting
use crate::db::{now, MetadataStore, User, USER_COLUMNS};
use crate::error::{TroveError, TroveResult};
use sqlx::{AnyConnection, Row};

impl MetadataStore {
    /// Insert a user; handle or email clashes are `Conflict`
    pub async fn create_user(
        &self,
        handle: &str,
        email: &str,
        password_hash: &str,
        storage_quota: i64,
        is_admin: bool,
    ) -> TroveResult<User> {
        let ts = now();
        let row = sqlx::query(
            "INSERT INTO users (handle, email, password_hash, storage_quota, storage_used, \
             is_admin, created_at, updated_at) VALUES ($1, $2, $3, $4, 0, $5, $6, $6) RETURNING id",
        )
        .bind(handle)
        .bind(email)
        .bind(password_hash)
        .bind(storage_quota)
        .bind(is_admin as i64)
        .bind(ts)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TroveError::conflict_on_unique(e, "Handle or email already registered"))?;

        let id: i64 = row.try_get("id")?;
        self.get_user(id)
            .await?
            .ok_or_else(|| TroveError::Internal(format!("user {} vanished after insert", id)))
    }

    pub async fn count_users(&self) -> TroveResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_user(&self, id: i64) -> TroveResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Look a user up by handle or email
    pub async fn find_user_by_handle(&self, identifier: &str) -> TroveResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE handle = $1 OR email = $1",
            USER_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Change a user's quota; usage above the new quota is allowed to stand
    pub async fn set_user_quota(&self, id: i64, storage_quota: i64) -> TroveResult<User> {
        let result = sqlx::query("UPDATE users SET storage_quota = $1, updated_at = $2 WHERE id = $3")
            .bind(storage_quota)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TroveError::NotFound(format!("user {}", id)));
        }

        self.get_user(id)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("user {}", id)))
    }

    /// Mark an account for deletion; the account purge job finishes the job
    pub async fn soft_delete_user(&self, id: i64) -> TroveResult<()> {
        let ts = now();
        let result = sqlx::query(
            "UPDATE users SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_user(id).await?.is_none() {
            return Err(TroveError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    /// Soft-deleted accounts whose retention window has elapsed
    pub async fn users_due_for_purge(
        &self,
        now: i64,
        default_retention_days: i64,
    ) -> TroveResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE deleted_at IS NOT NULL \
             AND deleted_at <= $1 - COALESCE(retention_days, $2) * 86400 ORDER BY id",
            USER_COLUMNS
        ))
        .bind(now)
        .bind(default_retention_days)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Remove the user row; folders and sessions cascade
    pub async fn delete_user_row(&self, id: i64) -> TroveResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move `storage_used` by `delta` inside the caller's transaction
    ///
    /// Growth is a single predicated UPDATE, so two uploads racing for the
    /// last free bytes cannot both succeed; the loser gets `QuotaExceeded`.
    /// Shrinking clamps at zero.
    pub async fn adjust_user_used_bytes(
        conn: &mut AnyConnection,
        user_id: i64,
        delta: i64,
    ) -> TroveResult<()> {
        if delta == 0 {
            return Ok(());
        }

        if delta < 0 {
            sqlx::query(
                "UPDATE users SET storage_used = CASE WHEN storage_used + $1 < 0 THEN 0 \
                 ELSE storage_used + $1 END, updated_at = $2 WHERE id = $3",
            )
            .bind(delta)
            .bind(now())
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
            return Ok(());
        }

        let result = sqlx::query(
            "UPDATE users SET storage_used = storage_used + $1, updated_at = $2 \
             WHERE id = $3 AND storage_used + $1 <= storage_quota",
        )
        .bind(delta)
        .bind(now())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let row = sqlx::query("SELECT storage_quota, storage_used FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("user {}", user_id)))?;

        let quota: i64 = row.try_get("storage_quota")?;
        let used: i64 = row.try_get("storage_used")?;
        Err(TroveError::QuotaExceeded {
            requested: delta as u64,
            available: (quota - used).max(0) as u64,
        })
    }
}
