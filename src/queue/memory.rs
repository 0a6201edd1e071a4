//! In-memory task queue
//!
//! Ready tasks live in a binary heap ordered by `(priority, sequence)`;
//! delayed tasks wait in a schedule list and are migrated into the heap by
//! `get()` once due.

use crate::queue::{QueueError, QueueResult, TaskQueue};
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;

/// A task in the ready heap
#[derive(Debug)]
struct QueuedTask {
    priority: i32,
    sequence: u64,
    task: Task,
}

// Lower priority first, then insertion order
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        Reverse((self.priority, self.sequence)).cmp(&Reverse((other.priority, other.sequence)))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

#[derive(Debug, Default)]
struct Inner {
    ready: BinaryHeap<QueuedTask>,
    scheduled: Vec<(DateTime<Utc>, i32, Task)>,
    next_sequence: u64,
    closed: bool,
}

impl Inner {
    fn push_ready(&mut self, task: Task, priority: i32) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.ready.push(QueuedTask {
            priority,
            sequence,
            task,
        });
    }

    /// Moves every schedule entry that is due into the ready heap
    fn migrate_due(&mut self, now: DateTime<Utc>) {
        if self.scheduled.is_empty() {
            return;
        }

        let mut due = Vec::new();
        let mut pending = Vec::with_capacity(self.scheduled.len());
        for entry in self.scheduled.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                pending.push(entry);
            }
        }
        self.scheduled = pending;

        // Earlier schedule times keep FIFO precedence among equal priorities
        due.sort_by_key(|entry| entry.0);
        for (_, priority, task) in due {
            self.push_ready(task, priority);
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Thread-safe in-process task queue
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the heap half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of tasks waiting for their schedule time
    pub fn scheduled_len(&self) -> usize {
        self.lock().scheduled.len()
    }
}

impl TaskQueue for MemoryTaskQueue {
    fn put(
        &self,
        task: Task,
        priority: i32,
        schedule_time: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        match schedule_time {
            Some(when) => inner.scheduled.push((when, priority, task)),
            None => inner.push_ready(task, priority),
        }
        Ok(())
    }

    fn get(&self) -> QueueResult<Task> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.migrate_due(Utc::now());
        inner
            .ready
            .pop()
            .map(|queued| queued.task)
            .ok_or(QueueError::Empty)
    }

    fn size(&self) -> QueueResult<usize> {
        let inner = self.lock();
        Ok(inner.ready.len() + inner.scheduled.len())
    }

    fn clear(&self) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.ready.clear();
        inner.scheduled.clear();
        Ok(())
    }

    fn close(&self) -> QueueResult<()> {
        let mut inner = self.lock();
        inner.ready.clear();
        inner.scheduled.clear();
        inner.closed = true;
        Ok(())
    }
}
