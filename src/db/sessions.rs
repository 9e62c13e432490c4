/// Login sessions
use crate::db::{now, MetadataStore, Session};
use crate::error::TroveResult;

impl MetadataStore {
    pub async fn create_session(
        &self,
        token_hash: &str,
        user_id: i64,
        payload: &str,
        expires_at: i64,
    ) -> TroveResult<()> {
        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, payload, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(payload)
        .bind(expires_at)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// An unexpired session
    pub async fn get_session(&self, token_hash: &str) -> TroveResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT token_hash, user_id, payload, expires_at, created_at FROM sessions \
             WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn delete_session(&self, token_hash: &str) -> TroveResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_user_sessions(&self, user_id: i64) -> TroveResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove sessions that expired at or before `now`
    pub async fn delete_expired_sessions(&self, now: i64) -> TroveResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
