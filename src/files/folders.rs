/// Folder paths and folder management
use crate::db::{Folder, MetadataStore};
use crate::error::{TroveError, TroveResult};
use tracing::info;

/// Longest allowed path segment, in characters
const MAX_SEGMENT_CHARS: usize = 255;

/// Canonical form of a folder path
///
/// The result is rooted at `/`, has no empty or `.` segments and no trailing
/// slash (except the root itself). `..` is rejected rather than resolved.
pub fn normalize_path(raw: &str) -> TroveResult<String> {
    let mut segments = Vec::new();

    for segment in raw.split(['/', '\\']) {
        let segment = segment.trim();
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(TroveError::Validation(format!(
                    "Folder path {:?} must not contain '..'",
                    raw
                )));
            }
            _ => {}
        }

        if segment.chars().count() > MAX_SEGMENT_CHARS {
            return Err(TroveError::Validation(format!(
                "Folder name exceeds {} characters",
                MAX_SEGMENT_CHARS
            )));
        }
        if segment.chars().any(char::is_control) {
            return Err(TroveError::Validation(
                "Folder names cannot contain control characters".to_string(),
            ));
        }
        segments.push(segment);
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Every folder from the top level down to `path` itself
///
/// `"/a/b"` yields `["/a", "/a/b"]`; the root yields nothing.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            current.push('/');
            current.push_str(segment);
            current.clone()
        })
        .collect()
}

/// Folder operations on behalf of a user
#[derive(Clone)]
pub struct FolderService {
    store: MetadataStore,
}

impl FolderService {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Create a folder and any missing parents
    pub async fn create(&self, user_id: i64, raw_path: &str) -> TroveResult<Folder> {
        let path = normalize_path(raw_path)?;
        let folder = self.store.create_folder(user_id, &path).await?;
        info!("Created folder {} for user {}", path, user_id);
        Ok(folder)
    }

    pub async fn list(&self, user_id: i64) -> TroveResult<Vec<Folder>> {
        self.store.list_folders(user_id).await
    }

    /// Delete an empty folder
    pub async fn delete(&self, user_id: i64, raw_path: &str) -> TroveResult<()> {
        let path = normalize_path(raw_path)?;
        if path == "/" {
            return Err(TroveError::Validation(
                "The root folder cannot be deleted".to_string(),
            ));
        }

        if self.store.get_folder(user_id, &path).await?.is_none() {
            return Err(TroveError::NotFound(format!("folder {}", path)));
        }

        if self.store.folder_has_children(user_id, &path).await? {
            return Err(TroveError::Conflict(format!("Folder {} is not empty", path)));
        }

        self.store.delete_folder_row(user_id, &path).await?;
        info!("Deleted folder {} for user {}", path, user_id);
        Ok(())
    }
}
