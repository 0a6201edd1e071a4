//! Task generator service
//!
//! Pulls tasks from a user-supplied producer, but only while the pipeline in
//! front of the network and parser is shallow enough. Once the producer is
//! exhausted the worker finishes and never restarts.

use crate::crawler::CrawlContext;
use crate::service::worker::{Step, UnitFactory, WorkerPool, WorkerUnit};
use crate::service::Service;
use crate::task::Task;
use crate::FlowError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// A lazy, single-pass source of tasks
pub type TaskProducer = Box<dyn Iterator<Item = Task> + Send>;

struct GeneratorUnit {
    ctx: Arc<CrawlContext>,
    producer: Option<TaskProducer>,
    threshold: usize,
}

#[async_trait]
impl WorkerUnit for GeneratorUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        let Some(producer) = self.producer.as_mut() else {
            return Ok(Step::Finished);
        };

        let depth = self.ctx.downstream_depth()?;
        if depth >= self.threshold {
            tracing::trace!("Generator waiting (depth {} >= {})", depth, self.threshold);
            return Ok(Step::Idle);
        }

        let mut injected = 0;
        for _ in depth..self.threshold {
            match producer.next() {
                Some(task) => {
                    self.ctx.route_task(task).await?;
                    injected += 1;
                }
                None => {
                    tracing::info!("Task generator exhausted");
                    self.producer = None;
                    self.ctx.stats.add("task-generated", injected);
                    return Ok(Step::Finished);
                }
            }
        }

        tracing::debug!("Generator injected {} tasks", injected);
        self.ctx.stats.add("task-generated", injected);
        Ok(Step::Worked)
    }
}

/// Paces injection from a task producer by downstream depth
pub struct TaskGeneratorService {
    pool: WorkerPool,
}

impl TaskGeneratorService {
    pub fn new(ctx: Arc<CrawlContext>, producer: TaskProducer) -> Self {
        let threshold = ctx.config.pipeline.task_queue_threshold();
        let idle_poll = ctx.config.pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();

        // The producer cannot be restarted: only the first unit gets it
        let producer = Mutex::new(Some(producer));
        let factory: UnitFactory = Arc::new(move || {
            let producer = producer.lock().unwrap_or_else(|p| p.into_inner()).take();
            Box::new(GeneratorUnit {
                ctx: ctx.clone(),
                producer,
                threshold,
            }) as Box<dyn WorkerUnit>
        });

        Self {
            pool: WorkerPool::new("task-generator", 1, factory, fatal_tx, idle_poll),
        }
    }

    /// The producer is exhausted (or was never started)
    pub fn is_finished(&self) -> bool {
        self.pool.has_exited()
    }
}

impl Service for TaskGeneratorService {
    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
