//! Local SQLite database backing the menu cache.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! connection state used by [`crate::cache::LocalCache`].

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::SyncError;

/// Database connection plus the file it was opened from.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open (or create) the database at `path`.
///
/// Creates the parent directory if needed, sets pragmas and runs pending
/// migrations. On corruption or open failure, deletes the file and retries
/// once: the cache is a mirror, so losing it is always safe.
pub fn init(path: &Path) -> Result<DbState, SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| SyncError::Cache(format!("Failed to create data dir: {e}")))?;
    }
    info!("Opening menu cache at {}", path.display());

    let conn = match open_and_migrate(path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Menu cache open failed ({}), deleting and retrying once",
                first_err
            );
            if path.exists() {
                let _ = fs::remove_file(path);
                let _ = fs::remove_file(path.with_extension("db-wal"));
                let _ = fs::remove_file(path.with_extension("db-shm"));
            }
            open_and_migrate(path).map_err(|e| {
                SyncError::Cache(format!("Menu cache open failed after retry: {e}"))
            })?
        }
    };

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: path.to_path_buf(),
    })
}

/// In-memory database with the full schema, for previews and tests.
pub fn open_in_memory() -> Result<DbState, SyncError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_migrate(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating menu cache from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// v1: keyed JSON blobs for categories, products and logo.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS menu_cache (
            cache_key TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Cache(format!("migration v1: {e}"))
    })?;
    info!("Applied migration v1 (menu_cache table)");
    Ok(())
}

/// v2: payload digest so unchanged sections are not rewritten every poll.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "BEGIN;
        ALTER TABLE menu_cache ADD COLUMN digest TEXT;
        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Cache(format!("migration v2: {e}"))
    })?;
    info!("Applied migration v2 (menu_cache digest)");
    Ok(())
}
