/// Application context and dependency injection
use crate::{
    account::AccountManager,
    blob_store::{self, BlobBackend},
    config::ServerConfig,
    db::MetadataStore,
    error::{TroveError, TroveResult},
    files::{folders::FolderService, FileService},
    upload::{spool, UploadPipeline},
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub store: MetadataStore,
    pub backend: Arc<dyn BlobBackend>,
    pub account_manager: Arc<AccountManager>,
    pub uploads: UploadPipeline,
    pub files: FileService,
    pub folders: FolderService,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> TroveResult<Self> {
        config.validate()?;

        // Scratch space must be writable before any upload is accepted
        spool::prepare_scratch_dir(&config.storage.temp_dir)
            .await
            .map_err(|e| {
                TroveError::Internal(format!(
                    "Scratch directory {} is not writable: {}",
                    config.storage.temp_dir.display(),
                    e
                ))
            })?;
        spool::sweep_scratch(&config.storage.temp_dir, config.storage.temp_max_age).await?;

        let store = MetadataStore::connect(&config.database_options()).await?;

        let backend = blob_store::connect(&config.storage.backend).await?;
        backend.validate_access(&CancellationToken::new()).await?;
        info!("✓ {} blob backend ready", backend.name());

        Ok(Self::from_parts(config, store, backend))
    }

    /// Wire services around an existing store and backend
    pub fn from_parts(
        config: ServerConfig,
        store: MetadataStore,
        backend: Arc<dyn BlobBackend>,
    ) -> Self {
        let config = Arc::new(config);

        let account_manager = Arc::new(AccountManager::new(store.clone(), config.clone()));
        let uploads = UploadPipeline::new(store.clone(), backend.clone(), config.clone());
        let files = FileService::new(store.clone(), backend.clone(), config.clone());
        let folders = FolderService::new(store.clone());

        Self {
            config,
            store,
            backend,
            account_manager,
            uploads,
            files,
            folders,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the context was built
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
