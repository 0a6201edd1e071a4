//! SQLite task queue
//!
//! Tasks are stored as JSON documents in a single table. Ordering comes from
//! `(priority, id)`, so equal priorities stay FIFO; rows whose schedule time
//! has passed are eligible directly, which is the persistent equivalent of
//! migrating the schedule list.

use crate::queue::{QueueError, QueueResult, TaskQueue};
use crate::task::Task;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Persistent task queue backed by SQLite
pub struct SqliteTaskQueue {
    conn: Mutex<Option<Connection>>,
    table: String,
}

impl SqliteTaskQueue {
    /// Opens (or creates) the queue table in the database at `path`
    ///
    /// `name` is used as the table name and must be a plain identifier.
    pub fn open(path: &Path, name: &str) -> QueueResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        Self::with_connection(conn, name)
    }

    /// Creates a queue in a private in-memory database
    pub fn in_memory(name: &str) -> QueueResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, name)
    }

    fn with_connection(conn: Connection, name: &str) -> QueueResult<Self> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(QueueError::Misuse(format!(
                "invalid queue table name '{}'",
                name
            )));
        }

        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                priority INTEGER NOT NULL,
                schedule_time INTEGER,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_order ON {table}(priority, id);
            ",
            table = name
        ))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            table: name.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn put(
        &self,
        task: Task,
        priority: i32,
        schedule_time: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        let payload = serde_json::to_string(&task)?;
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(QueueError::Closed)?;

        conn.execute(
            &format!(
                "INSERT INTO {} (priority, schedule_time, payload) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![priority, schedule_time.map(|t| t.timestamp_millis()), payload],
        )?;
        Ok(())
    }

    fn get(&self) -> QueueResult<Task> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(QueueError::Closed)?;
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        let row: Option<(i64, String)> = tx
            .query_row(
                &format!(
                    "SELECT id, payload FROM {}
                     WHERE schedule_time IS NULL OR schedule_time <= ?1
                     ORDER BY priority ASC, id ASC
                     LIMIT 1",
                    self.table
                ),
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (id, payload) = match row {
            Some(row) => row,
            None => return Err(QueueError::Empty),
        };

        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            params![id],
        )?;
        tx.commit()?;

        Ok(serde_json::from_str(&payload)?)
    }

    fn size(&self) -> QueueResult<usize> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(QueueError::Closed)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn clear(&self) -> QueueResult<()> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(QueueError::Closed)?;
        conn.execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }

    fn close(&self) -> QueueResult<()> {
        if let Some(conn) = self.lock().take() {
            conn.close().map_err(|(_, e)| QueueError::Sqlite(e))?;
        }
        Ok(())
    }
}
