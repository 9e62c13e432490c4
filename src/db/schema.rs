/// Schema migrations
///
/// Runs at start-up, in order:
/// 1. declarative: create missing tables, then add any column an older
///    table lacks (added columns are nullable or carry a default);
/// 2. imperative: move data out of the legacy `file_path` / `folder_path`
///    columns into `storage_path` / `logical_path` inside one transaction,
///    then drop the legacy columns and enforce `NOT NULL` where the engine
///    can do so on an existing column;
/// 3. indexes.
use crate::db::{Dialect, MetadataStore};
use crate::error::TroveResult;
use crate::files::folders::normalize_path;
use sqlx::{AnyConnection, Row};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Columns every table must end up with, as `ADD COLUMN` definitions
const USER_COLUMNS: &[(&str, &str)] = &[
    ("storage_quota", "BIGINT NOT NULL DEFAULT 0"),
    ("storage_used", "BIGINT NOT NULL DEFAULT 0"),
    ("is_admin", "BIGINT NOT NULL DEFAULT 0"),
    ("retention_days", "BIGINT"),
    ("deleted_at", "BIGINT"),
    ("created_at", "BIGINT NOT NULL DEFAULT 0"),
    ("updated_at", "BIGINT NOT NULL DEFAULT 0"),
];

const FILE_COLUMNS: &[(&str, &str)] = &[
    ("storage_path", "TEXT"),
    ("logical_path", "TEXT"),
    ("display_name", "TEXT NOT NULL DEFAULT ''"),
    ("original_name", "TEXT NOT NULL DEFAULT ''"),
    ("size", "BIGINT NOT NULL DEFAULT 0"),
    ("mime_type", "TEXT NOT NULL DEFAULT 'application/octet-stream'"),
    ("digest", "TEXT NOT NULL DEFAULT ''"),
    ("status", "TEXT NOT NULL DEFAULT 'completed'"),
    ("error_message", "TEXT"),
    ("quota_bytes", "BIGINT NOT NULL DEFAULT 0"),
    ("original_path", "TEXT"),
    ("deleted_at", "BIGINT"),
    ("created_at", "BIGINT NOT NULL DEFAULT 0"),
    ("updated_at", "BIGINT NOT NULL DEFAULT 0"),
];

const LEGACY_STORAGE_COLUMN: &str = "file_path";
const LEGACY_FOLDER_COLUMN: &str = "folder_path";

fn id_column(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
    }
}

fn create_tables(dialect: Dialect) -> Vec<String> {
    let id = id_column(dialect);
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                {id},
                handle TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                storage_quota BIGINT NOT NULL DEFAULT 0,
                storage_used BIGINT NOT NULL DEFAULT 0,
                is_admin BIGINT NOT NULL DEFAULT 0,
                retention_days BIGINT,
                deleted_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                {id},
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (user_id, path)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                {id},
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                storage_path TEXT NOT NULL DEFAULT '',
                logical_path TEXT NOT NULL DEFAULT '/',
                display_name TEXT NOT NULL,
                original_name TEXT NOT NULL,
                size BIGINT NOT NULL DEFAULT 0,
                mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                digest TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                quota_bytes BIGINT NOT NULL DEFAULT 0,
                original_path TEXT,
                deleted_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#
        ),
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            payload TEXT NOT NULL,
            expires_at BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        )
        "#
        .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS blob_gc (
            storage_key TEXT PRIMARY KEY,
            queued_at BIGINT NOT NULL,
            attempts BIGINT NOT NULL DEFAULT 0,
            last_error TEXT
        )
        "#
        .to_string(),
    ]
}

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_files_user_digest ON files(user_id, digest)",
    "CREATE INDEX IF NOT EXISTS idx_files_digest ON files(digest)",
    "CREATE INDEX IF NOT EXISTS idx_files_storage_path ON files(storage_path)",
    "CREATE INDEX IF NOT EXISTS idx_files_user_folder ON files(user_id, logical_path)",
    "CREATE INDEX IF NOT EXISTS idx_files_deleted_at ON files(deleted_at)",
    "CREATE INDEX IF NOT EXISTS idx_files_status_updated ON files(status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_users_deleted_at ON users(deleted_at)",
];

/// Live names are unique per folder; trashed and failed rows do not count
const CREATE_LIVE_NAME_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_live_name \
     ON files(user_id, logical_path, display_name) \
     WHERE deleted_at IS NULL AND status <> 'failed'";

/// Bring the schema up to date
pub async fn migrate(store: &MetadataStore) -> TroveResult<()> {
    let dialect = store.dialect();
    info!("Running {:?} schema migrations", dialect);

    // One connection throughout, so in-memory databases see their own DDL
    let mut conn = store.pool().acquire().await?;

    for ddl in create_tables(dialect) {
        sqlx::query(&ddl).execute(&mut *conn).await?;
    }

    let added_user = ensure_columns(&mut conn, dialect, "users", USER_COLUMNS).await?;
    let added_file = ensure_columns(&mut conn, dialect, "files", FILE_COLUMNS).await?;
    if !added_user.is_empty() || !added_file.is_empty() {
        info!(
            "Added columns: users {:?}, files {:?}",
            added_user, added_file
        );
    }

    if added_file.contains("quota_bytes") {
        // Older rows were all counted at full size
        sqlx::query("UPDATE files SET quota_bytes = size WHERE status = 'completed'")
            .execute(&mut *conn)
            .await?;
    }

    if added_file.contains("quota_bytes") || added_user.contains("storage_used") {
        sqlx::query(
            "UPDATE users SET storage_used = (SELECT COALESCE(SUM(f.quota_bytes), 0) \
             FROM files f WHERE f.user_id = users.id)",
        )
        .execute(&mut *conn)
        .await?;
    }

    migrate_legacy_paths(&mut conn, dialect).await?;

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }

    if let Err(e) = sqlx::query(CREATE_LIVE_NAME_INDEX).execute(&mut *conn).await {
        warn!(
            "Could not create unique file name index (duplicate names in existing data?): {}",
            e
        );
    }

    info!("✓ Schema migrations completed");
    Ok(())
}

/// Column names of `table`
pub async fn table_columns(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> TroveResult<HashSet<String>> {
    let rows = match dialect {
        Dialect::Sqlite => {
            sqlx::query("SELECT name FROM pragma_table_info($1)")
                .bind(table)
                .fetch_all(&mut *conn)
                .await?
        }
        Dialect::Postgres => {
            sqlx::query(
                "SELECT column_name::text AS name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
            )
            .bind(table)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
        .collect()
}

async fn ensure_columns(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
    wanted: &[(&str, &str)],
) -> TroveResult<HashSet<String>> {
    let existing = table_columns(conn, dialect, table).await?;
    let mut added = HashSet::new();

    for (name, definition) in wanted {
        if existing.contains(*name) {
            continue;
        }
        let ddl = format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, definition);
        debug!("{}", ddl);
        sqlx::query(&ddl).execute(&mut *conn).await?;
        added.insert(name.to_string());
    }

    Ok(added)
}

/// Storage key for a legacy `file_path` value, which may be a full path
fn legacy_storage_key(file_path: &str) -> String {
    file_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}

async fn migrate_legacy_paths(conn: &mut AnyConnection, dialect: Dialect) -> TroveResult<()> {
    let columns = table_columns(conn, dialect, "files").await?;
    let has_file_path = columns.contains(LEGACY_STORAGE_COLUMN);
    let has_folder_path = columns.contains(LEGACY_FOLDER_COLUMN);

    if !has_file_path && !has_folder_path {
        return Ok(());
    }

    info!(
        "Migrating legacy file columns (file_path: {}, folder_path: {})",
        has_file_path, has_folder_path
    );

    let mut tx = sqlx::Connection::begin(&mut *conn).await?;
    let mut moved = 0u64;

    if has_file_path {
        let rows = sqlx::query(&format!(
            "SELECT id, {} AS legacy FROM files WHERE storage_path IS NULL OR storage_path = ''",
            LEGACY_STORAGE_COLUMN
        ))
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            let id: i64 = row.try_get("id")?;
            let legacy: Option<String> = row.try_get("legacy")?;
            let key = legacy.as_deref().map(legacy_storage_key).unwrap_or_default();
            sqlx::query("UPDATE files SET storage_path = $1 WHERE id = $2")
                .bind(key)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            moved += 1;
        }
    }

    if has_folder_path {
        let rows = sqlx::query(&format!(
            "SELECT id, {} AS legacy FROM files WHERE logical_path IS NULL OR logical_path = ''",
            LEGACY_FOLDER_COLUMN
        ))
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            let id: i64 = row.try_get("id")?;
            let legacy: Option<String> = row.try_get("legacy")?;
            let path = legacy
                .as_deref()
                .and_then(|p| normalize_path(p).ok())
                .unwrap_or_else(|| "/".to_string());
            sqlx::query("UPDATE files SET logical_path = $1 WHERE id = $2")
                .bind(path)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
    }

    // Anything still unset gets the neutral value
    sqlx::query("UPDATE files SET storage_path = '' WHERE storage_path IS NULL")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE files SET logical_path = '/' WHERE logical_path IS NULL")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE files SET original_name = display_name WHERE original_name = ''")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE files SET display_name = original_name WHERE display_name = ''")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE files SET display_name = storage_path WHERE display_name = ''")
        .execute(&mut *tx)
        .await?;

    match dialect {
        Dialect::Postgres => {
            for column in ["storage_path", "logical_path"] {
                sqlx::query(&format!(
                    "ALTER TABLE files ALTER COLUMN {} SET NOT NULL",
                    column
                ))
                .execute(&mut *tx)
                .await?;
            }
        }
        Dialect::Sqlite => {
            warn!(
                "SQLite cannot add NOT NULL to existing columns; storage_path and \
                 logical_path stay nullable in the schema and are kept non-null by the application"
            );
        }
    }

    tx.commit().await?;
    info!("✓ Moved {} legacy storage paths", moved);

    // Dropping is best effort: an index or constraint on the old column
    // can block it, and the data already lives in the new columns
    for (present, column) in [
        (has_file_path, LEGACY_STORAGE_COLUMN),
        (has_folder_path, LEGACY_FOLDER_COLUMN),
    ] {
        if !present {
            continue;
        }
        let ddl = format!("ALTER TABLE files DROP COLUMN {}", column);
        match sqlx::query(&ddl).execute(&mut *conn).await {
            Ok(_) => debug!("Dropped legacy column files.{}", column),
            Err(e) => warn!("Could not drop legacy column files.{}: {}", column, e),
        }
    }

    Ok(())
}
