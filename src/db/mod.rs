/// Database layer for Trove
///
/// Manages the connection pool, runs schema migrations and provides typed
/// access to users, folders, file records, sessions and the blob deletion
/// queue. One engine-agnostic pool serves both SQLite and PostgreSQL; the
/// queries stick to the common subset (`$N` placeholders, BIGINT unix
/// seconds, integer flags) and branch on [`Dialect`] only where the engines
/// genuinely differ.

pub mod files;
pub mod folders;
pub mod gc;
pub mod models;
pub mod schema;
pub mod sessions;
pub mod users;

pub use models::*;

use crate::error::{TroveError, TroveResult};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::AnyPool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// SQL engine behind the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn from_url(url: &str) -> TroveResult<Self> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Dialect::Postgres)
        } else {
            Err(TroveError::Validation(format!(
                "Unsupported database URL scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }

    /// Row lock suffix for SELECTs inside a transaction
    ///
    /// SQLite serialises writers at the database level, so it needs none.
    pub fn for_update(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            Dialect::Postgres => " FOR UPDATE",
        }
    }
}

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub url: String,
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            enable_wal: true,
        }
    }
}

impl DatabaseOptions {
    /// Options for a file-backed (or `:memory:`) SQLite database
    pub fn sqlite(path: &Path) -> Self {
        let url = if path.as_os_str() == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path.to_string_lossy())
        };
        Self {
            url,
            ..Default::default()
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Metadata store: the pool plus the engine it talks to
#[derive(Clone)]
pub struct MetadataStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl MetadataStore {
    /// Connect and bring the schema up to date
    pub async fn connect(options: &DatabaseOptions) -> TroveResult<Self> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(&options.url)?;

        if dialect == Dialect::Sqlite && !options.is_memory() {
            ensure_sqlite_parent(&options.url).await?;
        }

        let connect_options = AnyConnectOptions::from_str(&options.url)?;

        let pool_options = if options.is_memory() {
            // Every connection to :memory: is its own database, so keep
            // exactly one and never let it expire
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new()
                .max_connections(options.max_connections)
                .acquire_timeout(Duration::from_secs(30))
        };

        let wal = dialect == Dialect::Sqlite && options.enable_wal && !options.is_memory();
        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if wal {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    }
                    if dialect == Dialect::Sqlite {
                        sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        info!("✓ Connected to {:?} metadata store", dialect);

        let store = Self { pool, dialect };
        schema::migrate(&store).await?;
        Ok(store)
    }

    /// In-memory SQLite store, fully migrated
    pub async fn in_memory() -> TroveResult<Self> {
        Self::connect(&DatabaseOptions::default()).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Test database connection
    pub async fn ping(&self) -> TroveResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        debug!("Closing metadata store pool");
        self.pool.close().await;
    }
}

/// Current time in unix seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn ensure_sqlite_parent(url: &str) -> TroveResult<()> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}
