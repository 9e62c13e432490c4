/// Folder rows
///
/// Paths arriving here are already normalised; the root `/` is implicit and
/// never stored.
use crate::db::{now, Folder, MetadataStore};
use crate::error::{TroveError, TroveResult};
use crate::files::folders::ancestors;
use sqlx::AnyConnection;

impl MetadataStore {
    /// Create `path` and every missing parent; existing folders are left alone
    pub async fn ensure_folder(&self, user_id: i64, path: &str) -> TroveResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::ensure_folder_in(&mut conn, user_id, path).await
    }

    pub(crate) async fn ensure_folder_in(
        conn: &mut AnyConnection,
        user_id: i64,
        path: &str,
    ) -> TroveResult<()> {
        let ts = now();
        for folder in ancestors(path) {
            sqlx::query(
                "INSERT INTO folders (user_id, path, created_at, updated_at) VALUES ($1, $2, $3, $3) \
                 ON CONFLICT (user_id, path) DO NOTHING",
            )
            .bind(user_id)
            .bind(&folder)
            .bind(ts)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Create a folder that must not exist yet
    pub async fn create_folder(&self, user_id: i64, path: &str) -> TroveResult<Folder> {
        if path == "/" || self.get_folder(user_id, path).await?.is_some() {
            return Err(TroveError::Conflict(format!("Folder {} already exists", path)));
        }

        self.ensure_folder(user_id, path).await?;
        self.get_folder(user_id, path)
            .await?
            .ok_or_else(|| TroveError::Internal(format!("folder {} vanished after insert", path)))
    }

    pub async fn get_folder(&self, user_id: i64, path: &str) -> TroveResult<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            "SELECT id, user_id, path, created_at, updated_at FROM folders \
             WHERE user_id = $1 AND path = $2",
        )
        .bind(user_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(folder)
    }

    pub async fn list_folders(&self, user_id: i64) -> TroveResult<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT id, user_id, path, created_at, updated_at FROM folders \
             WHERE user_id = $1 ORDER BY path",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// Whether a folder still holds files (live or in flight) or sub-folders
    pub async fn folder_has_children(&self, user_id: i64, path: &str) -> TroveResult<bool> {
        let files: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE user_id = $1 AND logical_path = $2 \
             AND deleted_at IS NULL AND status <> 'failed'",
        )
        .bind(user_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;

        if files > 0 {
            return Ok(true);
        }

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let subfolders: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM folders WHERE user_id = $1 \
             AND substr(path, 1, length($2)) = $2",
        )
        .bind(user_id)
        .bind(&prefix)
        .fetch_one(&self.pool)
        .await?;

        Ok(subfolders > 0)
    }

    pub async fn delete_folder_row(&self, user_id: i64, path: &str) -> TroveResult<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE user_id = $1 AND path = $2")
            .bind(user_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
