//! Network service
//!
//! Each worker takes one task from the task queue, checks its try limits,
//! fetches it through the transport and sends exactly one result to the
//! dispatcher. Retry decisions are left to the dispatcher.

use crate::crawler::CrawlContext;
use crate::queue::QueueError;
use crate::service::worker::{Step, UnitFactory, WorkerPool, WorkerUnit};
use crate::service::{Dispatch, Origin, Service};
use crate::transport::{NetworkError, NetworkResult, Transport, TransportError};
use crate::FlowError;
use async_trait::async_trait;
use std::sync::Arc;

struct NetworkUnit {
    ctx: Arc<CrawlContext>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl WorkerUnit for NetworkUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        let mut task = match self.ctx.task_queue.get() {
            Ok(task) => task,
            Err(QueueError::Empty) => return Ok(Step::Idle),
            Err(e) => return Err(e.into()),
        };

        task.network_try_count += 1;

        let (is_valid, reason) = self.ctx.check_task_limits(&task);
        if !is_valid {
            tracing::debug!("Rejecting {} ({})", task.url, reason);
            self.ctx.dispatch(Dispatch::rejected(task, reason, Origin::Network)).await?;
            return Ok(Step::Worked);
        }

        let snapshot = task.effective_request();
        let mut request = snapshot.clone();
        for extension in &self.ctx.extensions {
            extension.before_request(&task, &mut request);
        }

        tracing::debug!(
            "Fetching {} {} (try {})",
            request.method.as_str(),
            request.url,
            task.network_try_count
        );
        self.ctx.stats.inc("request-network");

        let result = match self.transport.fetch(&request).await {
            Ok(response) => {
                tracing::trace!("{} -> {}", request.url, response.status);
                NetworkResult::success(response, snapshot)
            }
            Err(TransportError::Network { kind, message }) => {
                tracing::debug!("{} failed: {} ({})", request.url, kind.abbreviation(), message);
                self.ctx
                    .stats
                    .inc(format!("network-error-{}", kind.abbreviation()));
                NetworkResult::failure(NetworkError::new(kind, message), snapshot)
            }
            Err(e @ TransportError::Other(_)) => return Err(e.into()),
        };

        self.ctx.dispatch(Dispatch::network(result, task)).await?;
        Ok(Step::Worked)
    }
}

/// Pool of fetching workers
pub struct NetworkService {
    pool: WorkerPool,
}

impl NetworkService {
    pub fn new(ctx: Arc<CrawlContext>, transport: Arc<dyn Transport>) -> Self {
        let size = ctx.config.pipeline.network_threads;
        let idle_poll = ctx.config.pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();

        let factory: UnitFactory = Arc::new(move || {
            Box::new(NetworkUnit {
                ctx: ctx.clone(),
                transport: transport.clone(),
            }) as Box<dyn WorkerUnit>
        });

        Self {
            pool: WorkerPool::new("network", size, factory, fatal_tx, idle_poll),
        }
    }
}

impl Service for NetworkService {
    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
