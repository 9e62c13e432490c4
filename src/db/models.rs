/// Database models
///
/// Rows are decoded by hand from `AnyRow`: the engine-agnostic driver only
/// knows integers, floats, text and blobs, so timestamps travel as unix
/// seconds and flags as 0/1 and are converted here.
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Hex SHA-256 of the empty input
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// User account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub handle: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub storage_quota: i64,
    pub storage_used: i64,
    pub is_admin: bool,
    /// Per-user override of the deleted-file retention window, in days
    pub retention_days: Option<i64>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// Bytes left before the quota is reached
    pub fn available_bytes(&self) -> i64 {
        (self.storage_quota - self.storage_used).max(0)
    }
}

impl<'r> FromRow<'r, AnyRow> for User {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            handle: row.try_get("handle")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            storage_quota: row.try_get("storage_quota")?,
            storage_used: row.try_get("storage_used")?,
            is_admin: row.try_get::<i64, _>("is_admin")? != 0,
            retention_days: row.try_get("retention_days")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Folder owned by a user; the root `/` is implicit and never stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: i64,
    pub user_id: i64,
    pub path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, AnyRow> for Folder {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            path: row.try_get("path")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Upload lifecycle of a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "uploading" => Ok(FileStatus::Uploading),
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status {:?}", other)),
        }
    }
}

/// File record
///
/// Several records may share one `storage_key`; the blob behind it lives
/// as long as any record (live or soft-deleted) points at it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip_serializing, default)]
    pub storage_key: String,
    pub logical_path: String,
    pub display_name: String,
    pub original_name: String,
    pub size: i64,
    pub mime_type: String,
    pub digest: String,
    pub status: FileStatus,
    pub error_message: Option<String>,
    /// Bytes this record currently contributes to its owner's usage
    #[serde(skip_serializing, default)]
    pub quota_bytes: i64,
    pub original_path: Option<String>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Completed and not in the trash
    pub fn is_live(&self) -> bool {
        self.status == FileStatus::Completed && !self.is_deleted()
    }
}

impl<'r> FromRow<'r, AnyRow> for FileRecord {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            storage_key: row.try_get("storage_path")?,
            logical_path: row.try_get("logical_path")?,
            display_name: row.try_get("display_name")?,
            original_name: row.try_get("original_name")?,
            size: row.try_get("size")?,
            mime_type: row.try_get("mime_type")?,
            digest: row.try_get("digest")?,
            status,
            error_message: row.try_get("error_message")?,
            quota_bytes: row.try_get("quota_bytes")?,
            original_path: row.try_get("original_path")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Column list matching [`FileRecord`]'s decoder
pub(crate) const FILE_COLUMNS: &str = "id, user_id, storage_path, logical_path, display_name, \
     original_name, size, mime_type, digest, status, error_message, quota_bytes, \
     original_path, deleted_at, created_at, updated_at";

/// Column list matching [`User`]'s decoder
pub(crate) const USER_COLUMNS: &str = "id, handle, email, password_hash, storage_quota, \
     storage_used, is_admin, retention_days, deleted_at, created_at, updated_at";

/// A file record about to be inserted
#[derive(Debug, Clone)]
pub struct NewFile {
    pub user_id: i64,
    pub storage_key: String,
    pub logical_path: String,
    pub display_name: String,
    pub original_name: String,
    pub size: i64,
    pub mime_type: String,
    pub digest: String,
    pub status: FileStatus,
    pub quota_bytes: i64,
}

/// What the commit of an upload writes into its reserved row
#[derive(Debug, Clone)]
pub struct UploadCommit {
    pub storage_key: String,
    pub size: i64,
    pub digest: String,
    pub mime_type: String,
    /// Bytes charged to the owner's quota
    pub quota_bytes: i64,
    /// The key was taken from an existing record and must still be held
    pub dedup_hit: bool,
}

/// Result of committing an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(FileRecord),
    /// The dedup source disappeared before the commit; nothing was written
    KeyGone,
}

/// Login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token_hash: String,
    pub user_id: i64,
    pub payload: String,
    pub expires_at: i64,
    pub created_at: i64,
}

impl<'r> FromRow<'r, AnyRow> for Session {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            token_hash: row.try_get("token_hash")?,
            user_id: row.try_get("user_id")?,
            payload: row.try_get("payload")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Blob whose physical deletion is outstanding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEntry {
    pub storage_key: String,
    pub queued_at: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl<'r> FromRow<'r, AnyRow> for GcEntry {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            storage_key: row.try_get("storage_key")?,
            queued_at: row.try_get("queued_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Uploading,
            FileStatus::Completed,
            FileStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("done".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_user_serialization_hides_hash() {
        let user = User {
            id: 1,
            handle: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: "$argon2id$secret".into(),
            storage_quota: 10,
            storage_used: 4,
            is_admin: false,
            retention_days: None,
            deleted_at: None,
            created_at: 0,
            updated_at: 0,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2"));
        assert_eq!(user.available_bytes(), 6);
    }
}
