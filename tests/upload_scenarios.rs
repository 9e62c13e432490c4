//! End-to-end upload, dedup, quota and GC behaviour against the disk backend
//! and a file-backed SQLite database.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use trove::blob_store::{BlobBackend, BlobBackendType, SaveOptions};
use trove::config::DatabaseConfig;
use trove::db::{now, FileStatus, User};
use trove::upload::UploadRequest;
use trove::{AppContext, ServerConfig, TroveError};

const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
const GIB: i64 = 1024 * 1024 * 1024;

struct Harness {
    ctx: AppContext,
    dir: TempDir,
}

impl Harness {
    async fn start(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::start_in(dir, tweak).await
    }

    async fn start_in(dir: TempDir, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig::for_testing(&dir.path().join("scratch"));
        config.database = DatabaseConfig::Sqlite {
            path: dir.path().join("trove.db"),
        };
        config.storage.backend = BlobBackendType::Disk {
            location: dir.path().join("blobs"),
        };
        config.storage.max_connections = 5;
        tweak(&mut config);

        let ctx = AppContext::new(config).await.unwrap();
        Self { ctx, dir }
    }

    async fn user(&self, handle: &str, quota: i64) -> User {
        self.ctx
            .store
            .create_user(handle, &format!("{}@example.com", handle), "hash", quota, false)
            .await
            .unwrap()
    }

    async fn upload(&self, user: &User, name: &str, bytes: &[u8]) -> Result<trove::db::FileRecord, TroveError> {
        let request = UploadRequest {
            original_name: name.to_string(),
            folder_path: "/".to_string(),
            ..Default::default()
        };
        self.ctx
            .uploads
            .upload(user.id, request, Cursor::new(bytes.to_vec()), &CancellationToken::new())
            .await
    }

    async fn used(&self, user: &User) -> i64 {
        self.ctx.store.get_user(user.id).await.unwrap().unwrap().storage_used
    }

    fn blob_count(&self) -> usize {
        count_entries(&self.dir.path().join("blobs"))
    }

    fn scratch_count(&self) -> usize {
        count_entries(&self.dir.path().join("scratch"))
    }
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn fresh_upload_then_dedup_hit() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10 * GIB).await;

    let first = h.upload(&alice, "hello.txt", b"abc").await.unwrap();
    assert_eq!(first.size, 3);
    assert_eq!(first.digest, ABC_SHA256);
    assert_eq!(first.status, FileStatus::Completed);
    assert_eq!(h.used(&alice).await, 3);
    assert_eq!(h.blob_count(), 1);

    let key = first.storage_key.clone();
    let (stem, ext) = key.rsplit_once('.').unwrap();
    assert_eq!(ext, "txt");
    assert!(uuid::Uuid::parse_str(stem).is_ok());

    let second = h.upload(&alice, "hello.txt", b"abc").await.unwrap();
    assert_eq!(second.digest, ABC_SHA256);
    assert_eq!(second.storage_key, key);
    assert_ne!(second.id, first.id);
    assert_eq!(h.blob_count(), 1);
    assert_eq!(h.used(&alice).await, 6);
    assert_eq!(h.scratch_count(), 0);
}

#[tokio::test]
async fn quota_exceeded_leaves_no_trace() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 5).await;
    h.upload(&alice, "a.txt", b"abc").await.unwrap();

    let err = h.upload(&alice, "b.txt", b"wxyz").await.unwrap_err();
    assert!(matches!(err, TroveError::QuotaExceeded { .. }));
    assert_eq!(h.used(&alice).await, 3);
    assert_eq!(h.ctx.store.user_file_ids(alice.id).await.unwrap().len(), 1);
    assert_eq!(h.blob_count(), 1);
    assert_eq!(h.scratch_count(), 0);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let h = Harness::start(|c| c.limits.max_upload_size = 1024).await;
    let alice = h.user("alice", 10 * GIB).await;

    let err = h.upload(&alice, "big.bin", &[7u8; 2048]).await.unwrap_err();
    assert!(matches!(err, TroveError::FileTooLarge { limit: 1024 }));
    assert!(h.ctx.store.user_file_ids(alice.id).await.unwrap().is_empty());
    assert_eq!(h.used(&alice).await, 0);
    assert_eq!(h.blob_count(), 0);
    assert_eq!(h.scratch_count(), 0);

    // Exactly at the limit is fine
    let ok = h.upload(&alice, "fits.bin", &[7u8; 1024]).await.unwrap();
    assert_eq!(ok.size, 1024);
}

#[tokio::test]
async fn shared_blob_survives_until_last_reference_is_purged() {
    let h = Harness::start(|c| c.retention.deleted_retention_days = 0).await;
    let alice = h.user("alice", 10 * GIB).await;

    let r1 = h.upload(&alice, "one.txt", b"shared bytes").await.unwrap();
    let r2 = h.upload(&alice, "two.txt", b"shared bytes").await.unwrap();
    let key = r1.storage_key.clone();
    assert_eq!(r2.storage_key, key);

    h.ctx.files.soft_delete(alice.id, r1.id).await.unwrap();
    assert_eq!(h.ctx.store.count_references_to_key(&key).await.unwrap(), 1);
    assert_eq!(h.blob_count(), 1);

    let report = h.ctx.files.sweep_expired(now() + 1).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(h.ctx.store.get_file(r1.id).await.unwrap().is_none());
    assert_eq!(h.blob_count(), 1);

    h.ctx.files.soft_delete(alice.id, r2.id).await.unwrap();
    h.ctx.files.sweep_expired(now() + 1).await.unwrap();
    assert_eq!(h.blob_count(), 0);
    assert_eq!(h.used(&alice).await, 0);

    // Purging an already purged id is a no-op
    assert!(h.ctx.files.purge_file(r2.id).await.unwrap().is_none());
}

#[tokio::test]
async fn soft_deleted_bytes_count_until_purged() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10).await;

    let file = h.upload(&alice, "notes.txt", b"12345678").await.unwrap();
    h.ctx.files.soft_delete(alice.id, file.id).await.unwrap();
    assert_eq!(h.used(&alice).await, 8);

    let err = h.upload(&alice, "more.txt", b"12345").await.unwrap_err();
    assert!(matches!(err, TroveError::QuotaExceeded { .. }));

    h.ctx.files.purge(alice.id, file.id).await.unwrap();
    assert_eq!(h.used(&alice).await, 0);
    h.upload(&alice, "more.txt", b"12345").await.unwrap();
}

#[tokio::test]
async fn restore_brings_file_back_to_its_folder() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10 * GIB).await;
    let request = UploadRequest {
        original_name: "report.pdf".to_string(),
        folder_path: "/work/2024".to_string(),
        ..Default::default()
    };
    let file = h
        .ctx
        .uploads
        .upload(alice.id, request, Cursor::new(b"%PDF".to_vec()), &CancellationToken::new())
        .await
        .unwrap();

    h.ctx.files.soft_delete(alice.id, file.id).await.unwrap();
    assert!(h.ctx.files.list(alice.id, "/work/2024").await.unwrap().is_empty());
    assert_eq!(h.ctx.files.list_deleted(alice.id).await.unwrap().len(), 1);

    let restored = h.ctx.files.restore(alice.id, file.id).await.unwrap();
    assert_eq!(restored.logical_path, "/work/2024");
    assert_eq!(h.ctx.files.list(alice.id, "/work/2024").await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_uploads_never_exceed_quota() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10).await;

    let mut tasks = Vec::new();
    for i in 0..6u8 {
        let uploads = h.ctx.uploads.clone();
        let user_id = alice.id;
        tasks.push(tokio::spawn(async move {
            let request = UploadRequest {
                original_name: format!("part-{}.bin", i),
                folder_path: "/".to_string(),
                ..Default::default()
            };
            uploads
                .upload(user_id, request, Cursor::new(vec![i; 4]), &CancellationToken::new())
                .await
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(TroveError::QuotaExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(h.used(&alice).await, 8);
    assert_eq!(h.ctx.store.charged_bytes(alice.id).await.unwrap(), 8);
    assert_eq!(h.blob_count(), 2);
}

#[tokio::test]
async fn restart_recovers_scratch_and_stale_rows() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    std::fs::create_dir_all(&scratch).unwrap();

    // A spool file left behind by a killed process
    let leftover = scratch.join("trove-upload-leftover");
    let file = std::fs::File::create(&leftover).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
        .unwrap();
    drop(file);

    let h = Harness::start_in(dir, |_| {}).await;
    assert!(!leftover.exists());

    let alice = h.user("alice", 10 * GIB).await;
    let row = h
        .ctx
        .store
        .reserve_upload(alice.id, "/", "half.bin", "half.bin", "application/octet-stream")
        .await
        .unwrap();
    assert_eq!(row.status, FileStatus::Pending);

    // Fresh rows are left alone
    assert_eq!(h.ctx.files.reap_stale_uploads().await.unwrap(), 0);

    sqlx::query("UPDATE files SET updated_at = $1 WHERE id = $2")
        .bind(now() - 48 * 3600)
        .bind(row.id)
        .execute(h.ctx.store.pool())
        .await
        .unwrap();

    assert_eq!(h.ctx.files.reap_stale_uploads().await.unwrap(), 1);
    assert!(h.ctx.store.get_file(row.id).await.unwrap().is_none());
    assert_eq!(h.used(&alice).await, 0);
}

#[tokio::test]
async fn interrupted_purge_leaves_blob_to_the_gc_queue() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10 * GIB).await;
    let file = h.upload(&alice, "gone.txt", b"abc").await.unwrap();

    // The record is deleted but the process stops before the blob is
    h.ctx.store.purge_file(file.id).await.unwrap().unwrap();
    assert_eq!(h.blob_count(), 1);
    let queued = h.ctx.store.pending_blob_deletions(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].storage_key, file.storage_key);

    let report = h.ctx.files.drain_gc_queue().await.unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(h.blob_count(), 0);
    assert!(h.ctx.store.pending_blob_deletions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn crashed_upload_blob_is_reclaimed_with_its_row() {
    let h = Harness::start(|_| {}).await;
    let alice = h.user("alice", 10 * GIB).await;

    // A process that died between writing the blob and committing
    let row = h
        .ctx
        .store
        .reserve_upload(alice.id, "/", "crash.bin", "crash.bin", "application/octet-stream")
        .await
        .unwrap();
    h.ctx
        .store
        .update_file_status(row.id, FileStatus::Uploading, None)
        .await
        .unwrap();
    let key = "0f0e0d0c-crash.bin";
    h.ctx.store.assign_upload_key(row.id, key).await.unwrap();
    let opts = SaveOptions {
        key: Some(key.to_string()),
        original_name: "crash.bin".to_string(),
        ..Default::default()
    };
    let mut source: &[u8] = b"half written";
    h.ctx
        .backend
        .save(&mut source, &opts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.blob_count(), 1);

    sqlx::query("UPDATE files SET updated_at = $1 WHERE id = $2")
        .bind(now() - 48 * 3600)
        .bind(row.id)
        .execute(h.ctx.store.pool())
        .await
        .unwrap();

    assert_eq!(h.ctx.files.reap_stale_uploads().await.unwrap(), 1);
    assert_eq!(h.blob_count(), 0);
    assert!(h.ctx.store.pending_blob_deletions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_upload_outlives_the_stale_upload_retention() {
    let h = Harness::start(|c| c.retention.failed_upload_retention = Duration::from_secs(2)).await;
    let alice = h.user("alice", 10 * GIB).await;

    let (mut client, body) = tokio::io::duplex(64);
    let uploads = h.ctx.uploads.clone();
    let user_id = alice.id;
    let task = tokio::spawn(async move {
        let request = UploadRequest {
            original_name: "slow.txt".to_string(),
            folder_path: "/".to_string(),
            ..Default::default()
        };
        uploads
            .upload(user_id, request, body, &CancellationToken::new())
            .await
    });

    client.write_all(b"ab").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Still streaming after more than the retention window
    assert_eq!(h.ctx.files.reap_stale_uploads().await.unwrap(), 0);

    client.write_all(b"c").await.unwrap();
    drop(client);
    let file = task.await.unwrap().unwrap();
    assert_eq!(file.digest, ABC_SHA256);
    assert_eq!(h.used(&alice).await, 3);
}
