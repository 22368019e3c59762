//! SQLite-backed bucket storage.
//!
//! Buckets and entries survive restarts. Deleting a bucket cascades to its
//! entries. Every call runs on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use shellcache_net::{Request, ResponseType};
use tracing::debug;

use super::{Cache, CacheEntry, CacheKey, CacheStorage};
use crate::CacheError;

/// Database schema version.
const SCHEMA_VERSION: i32 = 1;

type Shared = Arc<Mutex<Connection>>;

/// Run `f` against the connection on the blocking pool.
async fn with_conn<T, F>(conn: &Shared, f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&mut guard)
    })
    .await?
}

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_storage (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_name  TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS cache_entries (
            id               INTEGER PRIMARY KEY,
            cache_id         INTEGER NOT NULL,
            request_method   TEXT NOT NULL,
            request_url      TEXT NOT NULL,
            response_url     TEXT NOT NULL,
            status           INTEGER NOT NULL,
            status_text      TEXT NOT NULL,
            headers          TEXT NOT NULL,
            body             BLOB NOT NULL,
            response_type    TEXT NOT NULL,
            cached_at        INTEGER NOT NULL,
            UNIQUE (cache_id, request_method, request_url),
            FOREIGN KEY (cache_id) REFERENCES cache_storage(id) ON DELETE CASCADE
        );",
    )?;
    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
    Ok(())
}

fn insert_entry(conn: &Connection, cache_id: i64, entry: &CacheEntry) -> Result<(), CacheError> {
    let headers = serde_json::to_string(&entry.headers)?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries
            (cache_id, request_method, request_url, response_url, status, status_text,
             headers, body, response_type, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            cache_id,
            entry.key.method,
            entry.key.url,
            entry.url,
            entry.status,
            entry.status_text,
            headers,
            entry.body,
            entry.response_type.as_str(),
            entry.cached_at,
        ],
    )?;
    Ok(())
}

/// A bucket row in the database.
pub struct SqliteCache {
    conn: Shared,
    cache_id: i64,
    name: String,
}

impl SqliteCache {
    /// Writes through a handle whose bucket row is gone fail the foreign key.
    fn deleted_bucket(&self, err: CacheError) -> CacheError {
        match err {
            CacheError::Sqlite(rusqlite::Error::SqliteFailure(ref failure, _))
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                CacheError::BucketDeleted(self.name.clone())
            }
            other => other,
        }
    }
}

#[async_trait]
impl Cache for SqliteCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>, CacheError> {
        let key = CacheKey::from(request);
        let cache_id = self.cache_id;
        with_conn(&self.conn, move |conn| {
            let row = conn
                .query_row(
                    "SELECT response_url, status, status_text, headers, body, response_type,
                            cached_at
                     FROM cache_entries
                     WHERE cache_id = ?1 AND request_method = ?2 AND request_url = ?3",
                    params![cache_id, key.method, key.url],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u16>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, i64>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((url, status, status_text, headers, body, response_type, cached_at)) = row
            else {
                return Ok(None);
            };

            let response_type = response_type
                .parse::<ResponseType>()
                .map_err(|_| CacheError::Corrupt(format!("{}: bad response type", key)))?;

            Ok(Some(CacheEntry {
                key,
                url,
                status,
                status_text,
                headers: serde_json::from_str(&headers)?,
                body,
                response_type,
                cached_at,
            }))
        })
        .await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let cache_id = self.cache_id;
        with_conn(&self.conn, move |conn| insert_entry(conn, cache_id, &entry))
            .await
            .map_err(|e| self.deleted_bucket(e))
    }

    async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let cache_id = self.cache_id;
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            for entry in &entries {
                insert_entry(&tx, cache_id, entry)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| self.deleted_bucket(e))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let cache_id = self.cache_id;
        let key = key.clone();
        with_conn(&self.conn, move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries
                 WHERE cache_id = ?1 AND request_method = ?2 AND request_url = ?3",
                params![cache_id, key.method, key.url],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let cache_id = self.cache_id;
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_method, request_url FROM cache_entries
                 WHERE cache_id = ?1 ORDER BY request_method, request_url",
            )?;
            let keys = stmt
                .query_map(params![cache_id], |row| {
                    Ok(CacheKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

/// Bucket storage in a single SQLite database file.
#[derive(Clone)]
pub struct SqliteCacheStorage {
    conn: Shared,
}

impl SqliteCacheStorage {
    /// Open (or create) the database at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "Opened cache database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory database, gone when dropped.
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if name.is_empty() {
            return Err(CacheError::EmptyName);
        }

        let cache_name = name.to_string();
        let cache_id = with_conn(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cache_storage (cache_name) VALUES (?1)",
                params![cache_name],
            )?;
            let id = conn.query_row(
                "SELECT id FROM cache_storage WHERE cache_name = ?1",
                params![cache_name],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(id)
        })
        .await?;

        Ok(Arc::new(SqliteCache {
            conn: Arc::clone(&self.conn),
            cache_id,
            name: name.to_string(),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let cache_name = name.to_string();
        with_conn(&self.conn, move |conn| {
            let found = conn
                .query_row(
                    "SELECT id FROM cache_storage WHERE cache_name = ?1",
                    params![cache_name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let cache_name = name.to_string();
        with_conn(&self.conn, move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_storage WHERE cache_name = ?1",
                params![cache_name],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        with_conn(&self.conn, |conn| {
            let mut stmt = conn.prepare("SELECT cache_name FROM cache_storage ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}
