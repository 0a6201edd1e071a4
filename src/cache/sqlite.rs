//! SQLite cache backend

use crate::cache::{cache_key, CacheBackend, CacheError, CacheResult, CachedItem};
use crate::transport::Response;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    final_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL
);
"#;

/// Response cache stored in a SQLite database
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Opens (or creates) the cache database at `path`
    pub fn open(path: &Path) -> CacheResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        conn.execute_batch(CACHE_SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates a cache in a private in-memory database
    pub fn in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheBackend for SqliteCache {
    fn get(&self, url: &str) -> CacheResult<Option<CachedItem>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT final_url, status, headers, body, cached_at FROM cache WHERE key = ?1",
                params![cache_key(url)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((final_url, status, headers, body, cached_at)) = row else {
            return Ok(None);
        };

        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
            .map_err(|e| CacheError::Timestamp(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Some(CachedItem {
            url: url.to_string(),
            response: Response {
                url: final_url,
                status,
                headers,
                body,
            },
            cached_at,
        }))
    }

    fn save(&self, url: &str, response: &Response) -> CacheResult<()> {
        let headers = serde_json::to_string(&response.headers)?;
        let now = Utc::now().to_rfc3339();

        self.lock().execute(
            "INSERT OR REPLACE INTO cache (key, url, final_url, status, headers, body, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                cache_key(url),
                url,
                response.url,
                response.status,
                headers,
                response.body,
                now
            ],
        )?;
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.lock().execute("DELETE FROM cache", [])?;
        Ok(())
    }

    fn size(&self) -> CacheResult<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
