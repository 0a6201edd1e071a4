//! Redis task queue
//!
//! Tasks live in a sorted set scored by priority. Members are prefixed with a
//! zero-padded sequence number taken from a counter key, so members with an
//! equal score sort (and pop) in insertion order. Redis has no schedule list
//! here: putting a task with a schedule time is a misuse.

use crate::queue::{QueueError, QueueResult, TaskQueue};
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

/// Task queue stored in a Redis sorted set
pub struct RedisTaskQueue {
    client: ::redis::Client,
    conn: Mutex<Option<::redis::Connection>>,
    key: String,
    sequence_key: String,
    closed: std::sync::atomic::AtomicBool,
}

impl RedisTaskQueue {
    /// Creates the queue; the connection is opened lazily on first use
    pub fn new(url: &str, name: &str) -> QueueResult<Self> {
        let client = ::redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            key: format!("sumi-flow:{}", name),
            sequence_key: format!("sumi-flow:{}:seq", name),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Runs `f` with a live connection, reconnecting after a failure
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut ::redis::Connection) -> ::redis::RedisResult<T>,
    ) -> QueueResult<T> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.client.get_connection()?);
        }

        let conn = guard.as_mut().ok_or(QueueError::Closed)?;
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *guard = None;
                }
                Err(QueueError::Redis(e))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<::redis::Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Strips the `<sequence>:` prefix from a sorted-set member
fn decode_member(member: &str) -> QueueResult<Task> {
    let payload = member
        .split_once(':')
        .map(|(_, payload)| payload)
        .unwrap_or(member);
    Ok(serde_json::from_str(payload)?)
}

impl TaskQueue for RedisTaskQueue {
    fn put(
        &self,
        task: Task,
        priority: i32,
        schedule_time: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        if schedule_time.is_some() {
            return Err(QueueError::Misuse(
                "the redis task queue does not support delayed tasks".to_string(),
            ));
        }

        let payload = serde_json::to_string(&task)?;
        self.with_conn(|conn| {
            let sequence: u64 = ::redis::cmd("INCR").arg(&self.sequence_key).query(conn)?;
            let member = format!("{:020}:{}", sequence, payload);
            ::redis::cmd("ZADD")
                .arg(&self.key)
                .arg(priority)
                .arg(member)
                .query::<()>(conn)
        })
    }

    fn get(&self) -> QueueResult<Task> {
        // ZPOPMIN replies with a flat [member, score] list
        let popped: Vec<String> =
            self.with_conn(|conn| ::redis::cmd("ZPOPMIN").arg(&self.key).arg(1).query(conn))?;

        match popped.first() {
            Some(member) => decode_member(member),
            None => Err(QueueError::Empty),
        }
    }

    fn size(&self) -> QueueResult<usize> {
        self.with_conn(|conn| ::redis::cmd("ZCARD").arg(&self.key).query(conn))
    }

    fn clear(&self) -> QueueResult<()> {
        self.with_conn(|conn| {
            ::redis::cmd("DEL")
                .arg(&self.key)
                .arg(&self.sequence_key)
                .query::<()>(conn)
        })
    }

    fn close(&self) -> QueueResult<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.lock().take();
        Ok(())
    }
}
