//! Cache module: stored responses keyed by URL
//!
//! The cache reader consults a `CacheBackend` before a task reaches the
//! network; the cache writer stores successful GET responses afterwards.

mod sqlite;

pub use sqlite::SqliteCache;

use crate::transport::Response;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache timestamp: {0}")]
    Timestamp(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// A response read back from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    pub url: String,
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

/// Storage the cache services read from and write to
pub trait CacheBackend: Send + Sync {
    fn get(&self, url: &str) -> CacheResult<Option<CachedItem>>;

    /// Stores `response` under `url`, replacing an earlier entry
    fn save(&self, url: &str, response: &Response) -> CacheResult<()>;

    fn clear(&self) -> CacheResult<()>;

    fn size(&self) -> CacheResult<usize>;
}

/// Cache key for a URL: hex SHA-256 digest
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
