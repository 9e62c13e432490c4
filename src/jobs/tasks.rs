/// Background task implementations
use crate::{
    context::AppContext,
    db::now,
    error::{TroveError, TroveResult},
    upload::spool,
};
use tokio_util::sync::CancellationToken;

/// Purge expired soft-deleted files, then retry queued blob deletions
pub async fn retention_sweep(ctx: &AppContext) -> TroveResult<u64> {
    let expired = ctx.files.sweep_expired(now()).await?;
    let drained = ctx.files.drain_gc_queue().await?;
    Ok(expired.purged + drained.purged)
}

/// Reclaim upload rows that never completed
pub async fn cleanup_stale_uploads(ctx: &AppContext) -> TroveResult<u64> {
    ctx.files.reap_stale_uploads().await
}

/// Remove abandoned spool files
pub async fn sweep_scratch(ctx: &AppContext) -> TroveResult<usize> {
    let storage = &ctx.config.storage;
    Ok(spool::sweep_scratch(&storage.temp_dir, storage.temp_max_age).await?)
}

/// Cleanup expired sessions
pub async fn cleanup_expired_sessions(ctx: &AppContext) -> TroveResult<u64> {
    ctx.account_manager.cleanup_sessions().await
}

/// Purge accounts marked for deletion after the retention window
pub async fn purge_deleted_accounts(ctx: &AppContext) -> TroveResult<u64> {
    ctx.account_manager.purge_deleted_accounts(&ctx.files).await
}

/// Health check - verify the database and the blob backend answer
pub async fn health_check(ctx: &AppContext) -> TroveResult<()> {
    ctx.store.ping().await?;
    ctx.backend
        .health(&CancellationToken::new())
        .await
        .map_err(|e| TroveError::BackendUnavailable(format!("{}: {}", ctx.backend.name(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobBackend;
    use crate::config::ServerConfig;
    use crate::db::MetadataStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tasks_run_on_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let ctx = AppContext::from_parts(
            ServerConfig::for_testing(dir.path()),
            store,
            Arc::new(MemoryBlobBackend::new()),
        );

        assert_eq!(retention_sweep(&ctx).await.unwrap(), 0);
        assert_eq!(cleanup_stale_uploads(&ctx).await.unwrap(), 0);
        assert_eq!(sweep_scratch(&ctx).await.unwrap(), 0);
        assert_eq!(cleanup_expired_sessions(&ctx).await.unwrap(), 0);
        assert_eq!(purge_deleted_accounts(&ctx).await.unwrap(), 0);
        health_check(&ctx).await.unwrap();
    }
}
