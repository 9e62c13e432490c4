/// Scratch files that hold an upload while it is hashed
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name prefix of every spool file
pub const SPOOL_PREFIX: &str = "trove-upload-";

/// Spool file that is removed when the guard is dropped
///
/// The backend may move the file away during a save; a missing file at drop
/// time is fine.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    /// Create a fresh spool in `dir`, returning the guard and the open file
    pub async fn create(dir: &Path) -> io::Result<(Self, fs::File)> {
        let path = dir.join(format!("{}{}", SPOOL_PREFIX, Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed spool {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove spool {}: {}", self.path.display(), e),
        }
    }
}

/// Make sure the scratch directory exists and accepts writes
pub async fn prepare_scratch_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir).await?;

    let probe = dir.join(format!(".trove-write-probe-{}", Uuid::new_v4()));
    fs::write(&probe, b"probe").await?;
    fs::remove_file(&probe).await?;
    Ok(())
}

/// Remove spool files last modified more than `max_age` ago
///
/// Returns how many files were removed. Files without the spool prefix are
/// never touched.
pub async fn sweep_scratch(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SPOOL_PREFIX) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!("Cannot stat scratch file {:?}: {}", name, e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::now());
        if modified > cutoff {
            continue;
        }

        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale spool {:?}: {}", name, e),
        }
    }

    if removed > 0 {
        info!("Swept {} stale spool files from {}", removed, dir.display());
    }
    Ok(removed)
}
