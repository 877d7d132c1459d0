//! Best-effort local mirror of the last known menu.
//!
//! Caching is an optimization, never a dependency: every write failure is
//! logged and swallowed, and a corrupt entry is dropped and replaced with an
//! empty default instead of surfacing an error.

use std::path::Path;

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::db::{self, DbState};
use crate::error::SyncError;
use crate::models::{Category, Logo, Product};

const KEY_CATEGORIES: &str = "categories";
const KEY_PRODUCTS: &str = "products";
const KEY_LOGO: &str = "logo";

/// Menu contents as last written to the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedMenu {
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
    pub logo: Option<Logo>,
}

impl CachedMenu {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.products.is_empty() && self.logo.is_none()
    }
}

pub struct LocalCache {
    db: Option<DbState>,
}

impl LocalCache {
    /// Open the cache file. If the database cannot be opened the cache runs
    /// disabled: saves are ignored and loads return nothing.
    pub fn open(path: &Path) -> Self {
        match db::init(path) {
            Ok(db) => Self { db: Some(db) },
            Err(e) => {
                error!(path = %path.display(), error = %e, "menu cache disabled");
                Self::disabled()
            }
        }
    }

    pub fn in_memory() -> Self {
        match db::open_in_memory() {
            Ok(db) => Self { db: Some(db) },
            Err(e) => {
                error!(error = %e, "in-memory menu cache unavailable");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { db: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Backing file, or `None` when disabled.
    pub fn path(&self) -> Option<&Path> {
        self.db.as_ref().map(|db| db.db_path.as_path())
    }

    /// Persist the menu. Never fails; `logo = None` removes the stored logo.
    pub fn save(&self, categories: &[Category], products: &[Product], logo: Option<&Logo>) {
        if let Err(e) = self.try_save(categories, products, logo) {
            warn!(error = %e, "menu cache save failed, continuing without cache");
        }
    }

    fn try_save(
        &self,
        categories: &[Category],
        products: &[Product],
        logo: Option<&Logo>,
    ) -> Result<(), SyncError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let conn = db
            .conn
            .lock()
            .map_err(|e| SyncError::Cache(format!("cache lock poisoned: {e}")))?;

        write_entry(&conn, KEY_CATEGORIES, categories)?;
        write_entry(&conn, KEY_PRODUCTS, products)?;
        match logo {
            Some(logo) => write_entry(&conn, KEY_LOGO, logo)?,
            None => {
                conn.execute(
                    "DELETE FROM menu_cache WHERE cache_key = ?1",
                    params![KEY_LOGO],
                )?;
            }
        }
        trace!(
            categories = categories.len(),
            products = products.len(),
            has_logo = logo.is_some(),
            "menu cache saved"
        );
        Ok(())
    }

    /// Read the cached menu. Never fails.
    pub fn load(&self) -> CachedMenu {
        let Some(db) = &self.db else {
            return CachedMenu::default();
        };
        let conn = match db.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                error!("menu cache lock failed: {e}");
                return CachedMenu::default();
            }
        };

        CachedMenu {
            categories: read_entry::<Vec<Category>>(&conn, KEY_CATEGORIES).unwrap_or_default(),
            products: read_entry::<Vec<Product>>(&conn, KEY_PRODUCTS).unwrap_or_default(),
            logo: read_entry::<Logo>(&conn, KEY_LOGO),
        }
    }

    pub fn clear(&self) {
        let Some(db) = &self.db else {
            return;
        };
        match db.conn.lock() {
            Ok(conn) => {
                if let Err(e) = conn.execute("DELETE FROM menu_cache", []) {
                    warn!("menu cache clear failed: {e}");
                }
            }
            Err(e) => error!("menu cache lock failed: {e}"),
        }
    }
}

fn payload_digest(json: &str) -> String {
    format!("md5:{:x}", md5::compute(json.as_bytes()))
}

/// Upsert one entry, skipping the write when the payload is unchanged.
fn write_entry<T: Serialize + ?Sized>(
    conn: &rusqlite::Connection,
    key: &str,
    value: &T,
) -> Result<(), SyncError> {
    let json = serde_json::to_string(value)
        .map_err(|e| SyncError::Cache(format!("serialize {key}: {e}")))?;
    let digest = payload_digest(&json);

    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT digest FROM menu_cache WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    if current.flatten().as_deref() == Some(digest.as_str()) {
        trace!(key, "menu cache entry unchanged");
        return Ok(());
    }

    conn.execute(
        "INSERT INTO menu_cache (cache_key, data, digest, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(cache_key) DO UPDATE SET
            data = excluded.data,
            digest = excluded.digest,
            updated_at = excluded.updated_at",
        params![key, json, digest],
    )?;
    debug!(key, bytes = json.len(), "menu cache entry written");
    Ok(())
}

/// Read one entry. A malformed entry is deleted and treated as missing.
fn read_entry<T: DeserializeOwned>(conn: &rusqlite::Connection, key: &str) -> Option<T> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM menu_cache WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            error!("menu_cache[{key}] read failed: {e}");
            None
        });

    let raw = raw?;
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("menu_cache[{key}] is malformed ({e}), clearing entry");
            if let Err(e) = conn.execute(
                "DELETE FROM menu_cache WHERE cache_key = ?1",
                params![key],
            ) {
                error!("menu_cache[{key}] clear failed: {e}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<Category>, Vec<Product>, Logo) {
        (
            vec![Category::new("cat-1", "Pães", 1)],
            vec![Product::new("p1", "Pão francês", 0.8, "cat-1")],
            Logo::new("https://cdn.example/logo.png"),
        )
    }

    fn corrupt(cache: &LocalCache, key: &str) {
        let db = cache.db.as_ref().unwrap();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO menu_cache (cache_key, data) VALUES (?1, '{not json')
             ON CONFLICT(cache_key) DO UPDATE SET data = excluded.data, digest = NULL",
            params![key],
        )
        .unwrap();
    }

    fn row_count(cache: &LocalCache, key: &str) -> i64 {
        let db = cache.db.as_ref().unwrap();
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM menu_cache WHERE cache_key = ?1",
            params![key],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let cache = LocalCache::in_memory();
        let (cats, prods, logo) = sample();
        cache.save(&cats, &prods, Some(&logo));

        let loaded = cache.load();
        assert_eq!(loaded.categories, cats);
        assert_eq!(loaded.products, prods);
        assert_eq!(loaded.logo, Some(logo));
    }

    #[test]
    fn test_save_without_logo_removes_it() {
        let cache = LocalCache::in_memory();
        let (cats, prods, logo) = sample();
        cache.save(&cats, &prods, Some(&logo));
        cache.save(&cats, &prods, None);
        assert_eq!(cache.load().logo, None);
    }

    #[test]
    fn test_corrupt_entry_is_cleared_and_defaulted() {
        let cache = LocalCache::in_memory();
        let (cats, prods, logo) = sample();
        cache.save(&cats, &prods, Some(&logo));
        corrupt(&cache, KEY_PRODUCTS);

        let loaded = cache.load();
        assert_eq!(loaded.categories, cats);
        assert!(loaded.products.is_empty());
        assert_eq!(row_count(&cache, KEY_PRODUCTS), 0);
    }

    #[test]
    fn test_unchanged_payload_is_not_rewritten() {
        let cache = LocalCache::in_memory();
        let (cats, prods, _) = sample();
        cache.save(&cats, &prods, None);
        {
            let conn = cache.db.as_ref().unwrap().conn.lock().unwrap();
            conn.execute(
                "UPDATE menu_cache SET updated_at = 'marker' WHERE cache_key = ?1",
                params![KEY_CATEGORIES],
            )
            .unwrap();
        }
        cache.save(&cats, &prods, None);
        let conn = cache.db.as_ref().unwrap().conn.lock().unwrap();
        let updated_at: String = conn
            .query_row(
                "SELECT updated_at FROM menu_cache WHERE cache_key = ?1",
                params![KEY_CATEGORIES],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(updated_at, "marker");
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = LocalCache::disabled();
        let (cats, prods, logo) = sample();
        cache.save(&cats, &prods, Some(&logo));
        assert!(cache.load().is_empty());
        assert!(!cache.is_enabled());
        cache.clear();
    }

    #[test]
    fn test_file_cache_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("menu-cache.db");
        let (cats, prods, logo) = sample();
        {
            let cache = LocalCache::open(&path);
            cache.save(&cats, &prods, Some(&logo));
        }
        let reopened = LocalCache::open(&path);
        assert_eq!(reopened.load().products, prods);
        assert_eq!(reopened.path(), Some(path.as_path()));
        reopened.clear();
        assert!(reopened.load().is_empty());
    }
}
