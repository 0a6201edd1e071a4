//! Parse service
//!
//! Workers run the handler registered for each fetched task and forward
//! everything it produces to the dispatcher. A handler error or panic is
//! forwarded too, so one bad handler never kills a worker. A worker with a
//! request budget retires after that many results; the supervisor restarts
//! it, along with any worker that died.

use crate::crawler::{CrawlContext, HandlerOutput};
use crate::service::worker::{Step, UnitFactory, WorkerPool, WorkerUnit};
use crate::service::{Dispatch, DispatchItem, ParseJob, Service};
use crate::FlowError;
use async_trait::async_trait;
use std::sync::Arc;

struct ParseUnit {
    ctx: Arc<CrawlContext>,
    /// Results handled by this worker since it (re)started
    handled: u64,
    budget: u64,
}

#[async_trait]
impl WorkerUnit for ParseUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        if self.budget > 0 && self.handled >= self.budget {
            tracing::debug!("Parser worker retiring after {} results", self.handled);
            return Ok(Step::Finished);
        }

        let ParseJob { result, task } = match self.ctx.channels.parse_rx.try_recv() {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(Step::Idle),
            Err(_) => return Ok(Step::Finished),
        };
        self.handled += 1;

        tracing::trace!("Parsing {} with handler '{}'", task.url, task.name);
        match self.ctx.registry.call_handler(&result, &task) {
            Ok(outputs) => {
                for output in outputs {
                    let item = match output {
                        HandlerOutput::Task(next) => DispatchItem::Task(next),
                        HandlerOutput::Data(data) => DispatchItem::Data(data),
                        HandlerOutput::Error(e) => DispatchItem::Error(e),
                    };
                    self.ctx
                        .dispatch(Dispatch::from_parser(item, task.clone()))
                        .await?;
                }
                self.ctx
                    .dispatch(Dispatch::from_parser(DispatchItem::Completed, task))
                    .await?;
            }
            Err(e) => {
                self.ctx
                    .dispatch(Dispatch::from_parser(DispatchItem::Error(e), task))
                    .await?;
            }
        }
        Ok(Step::Worked)
    }
}

/// Restarts dead parse workers
struct SupervisorUnit {
    workers: Arc<WorkerPool>,
}

#[async_trait]
impl WorkerUnit for SupervisorUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        let revived = self.workers.revive_dead();
        if revived > 0 {
            tracing::info!("Supervisor restarted {} parser workers", revived);
        }
        Ok(Step::Idle)
    }
}

/// Parser workers plus their supervisor
pub struct ParseService {
    workers: Arc<WorkerPool>,
    supervisor: WorkerPool,
}

impl ParseService {
    pub fn new(ctx: Arc<CrawlContext>) -> Self {
        let pipeline = &ctx.config.pipeline;
        let size = pipeline.parser_threads;
        let budget = pipeline.parser_requests_per_process;
        let idle_poll = pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();

        let factory: UnitFactory = Arc::new(move || {
            Box::new(ParseUnit {
                ctx: ctx.clone(),
                handled: 0,
                budget,
            }) as Box<dyn WorkerUnit>
        });
        let workers = Arc::new(WorkerPool::new(
            "parser",
            size,
            factory,
            fatal_tx.clone(),
            idle_poll,
        ));

        let supervised = workers.clone();
        let supervisor_factory: UnitFactory = Arc::new(move || {
            Box::new(SupervisorUnit {
                workers: supervised.clone(),
            }) as Box<dyn WorkerUnit>
        });

        Self {
            workers,
            supervisor: WorkerPool::new(
                "parser-supervisor",
                1,
                supervisor_factory,
                fatal_tx,
                idle_poll,
            ),
        }
    }
}

#[async_trait]
impl Service for ParseService {
    fn pool(&self) -> &WorkerPool {
        &self.workers
    }

    fn start(&self) {
        self.workers.start();
        self.supervisor.start();
    }

    fn stop(&self) {
        // Supervisor first, so it cannot revive a worker being stopped
        self.supervisor.stop();
        self.workers.stop();
    }

    async fn pause(&self) {
        self.supervisor.pause().await;
        self.workers.pause().await;
    }

    fn resume(&self) {
        self.workers.resume();
        self.supervisor.resume();
    }

    fn is_alive(&self) -> bool {
        self.workers.is_alive() || self.supervisor.is_alive()
    }

    async fn join(&self) {
        self.supervisor.join().await;
        self.workers.join().await;
    }
}
