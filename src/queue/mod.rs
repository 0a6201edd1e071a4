//! Task queue module: ordered and delayed storage of pending tasks
//!
//! Every backend honours the same contract:
//! - lower priority values dequeue first, FIFO among equal priorities
//!   (as far as the backend's physical ordering allows)
//! - a task put with a schedule time is not returned before that time
//! - `size()` counts ready and not-yet-due tasks
//! - an empty queue is reported as `QueueError::Empty`, not a failure
//!
//! Backends:
//! - `MemoryTaskQueue`: in-process heap plus schedule list
//! - `SqliteTaskQueue`: persistent, survives restarts
//! - `RedisTaskQueue`: priority sorted set, no delayed scheduling

mod memory;
mod redis;
mod sqlite;

pub use self::redis::RedisTaskQueue;
pub use memory::MemoryTaskQueue;
pub use sqlite::SqliteTaskQueue;

use crate::config::{QueueBackend, QueueConfig};
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// No eligible task right now
    #[error("task queue is empty")]
    Empty,

    /// The caller asked for something the backend cannot do
    #[error("queue misuse: {0}")]
    Misuse(String),

    #[error("task queue has been closed")]
    Closed,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Trait for task queue backends
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task now, or defers it until `schedule_time`
    fn put(&self, task: Task, priority: i32, schedule_time: Option<DateTime<Utc>>)
        -> QueueResult<()>;

    /// Returns the next eligible task or `QueueError::Empty`
    fn get(&self) -> QueueResult<Task>;

    /// Ready plus scheduled tasks
    fn size(&self) -> QueueResult<usize>;

    /// Drops every ready and scheduled task
    fn clear(&self) -> QueueResult<()>;

    /// Releases backend resources; later calls fail with `QueueError::Closed`
    fn close(&self) -> QueueResult<()>;
}

/// Opens the backend selected in the configuration
///
/// # Arguments
///
/// * `config` - The `[queue]` section: backend, name, and its path or URL
///
/// # Returns
///
/// * `Ok(Arc<dyn TaskQueue>)` - The opened queue, shared by every service
/// * `Err(QueueError)` - The backend could not be opened
pub fn open_queue(config: &QueueConfig) -> QueueResult<Arc<dyn TaskQueue>> {
    let queue: Arc<dyn TaskQueue> = match config.backend {
        QueueBackend::Memory => Arc::new(MemoryTaskQueue::new()),
        QueueBackend::Sqlite => {
            let path = config.path.as_deref().ok_or_else(|| {
                QueueError::Misuse("sqlite queue backend requires a path".to_string())
            })?;
            Arc::new(SqliteTaskQueue::open(Path::new(path), &config.name)?)
        }
        QueueBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                QueueError::Misuse("redis queue backend requires a url".to_string())
            })?;
            Arc::new(RedisTaskQueue::new(url, &config.name)?)
        }
    };
    Ok(queue)
}
