//! Task dispatcher
//!
//! The only place retry accounting happens. Every network result, cache hit,
//! handler output and handler error passes through one worker, so the
//! counters and re-queue decisions never race.

use crate::crawler::{CrawlContext, HandlerError};
use crate::service::worker::{Step, UnitFactory, WorkerPool, WorkerUnit};
use crate::service::{Dispatch, DispatchItem, FatalError, FatalKind, ParseJob, Service};
use crate::task::{Data, Task};
use crate::transport::NetworkResult;
use crate::FlowError;
use async_trait::async_trait;
use std::sync::Arc;

struct DispatcherUnit {
    ctx: Arc<CrawlContext>,
}

impl DispatcherUnit {
    async fn handle(&self, dispatch: Dispatch) -> Result<(), FlowError> {
        let Dispatch { item, task, .. } = dispatch;

        match (item, task) {
            (DispatchItem::Task(next), _) => self.ctx.route_task(next).await?,
            (DispatchItem::Nothing, _) => {}
            (DispatchItem::Data(data), origin) => self.handle_data(data, origin.as_ref()).await?,
            (DispatchItem::Error(HandlerError::ResponseNotValid(reason)), Some(task)) => {
                self.retry_integrity(task, &reason).await?
            }
            (DispatchItem::Error(error), origin) => self.handle_error(error, origin.as_ref()).await?,
            (DispatchItem::Network(result), Some(task)) => self.handle_network(*result, task).await?,
            (DispatchItem::Rejected { reason }, Some(task)) => self.handle_rejected(task, reason),
            (DispatchItem::Completed, Some(task)) => {
                tracing::debug!("Task {} {} processed", task.name, task.url);
                self.ctx.stats.inc("task-processed");
                self.ctx.stats.inc(format!("task-{}-ok", task.name));
            }
            (item, None) => {
                let fatal = FatalError::new(
                    FatalKind::Misuse,
                    format!("unknown result reached the dispatcher: {:?}", item),
                    "dispatcher",
                );
                self.escalate(fatal).await;
            }
        }
        Ok(())
    }

    async fn handle_network(&self, result: NetworkResult, mut task: Task) -> Result<(), FlowError> {
        for extension in &self.ctx.extensions {
            extension.after_response(&task, &result);
        }

        if let Some(status) = result.status() {
            if self.ctx.is_valid_response_code(status, &task) {
                if !result.from_cache && self.ctx.cache_enabled() && task.is_cacheable() {
                    if let Some(response) = result.response() {
                        self.ctx
                            .channels
                            .cache_write_tx
                            .send((task.clone(), response.clone()))
                            .await
                            .map_err(|_| FlowError::ChannelClosed("cache writer".to_string()))?;
                    }
                }
                return self
                    .ctx
                    .channels
                    .parse_tx
                    .send(ParseJob { result, task })
                    .await
                    .map_err(|_| FlowError::ChannelClosed("parser".to_string()));
            }
        }

        let reason = match (result.error_abbreviation(), result.status()) {
            (Some(abbreviation), _) => abbreviation.to_string(),
            (None, Some(status)) => format!("status-{}", status),
            (None, None) => "unknown".to_string(),
        };

        if task.network_try_count < self.ctx.config.pipeline.network_try_limit {
            tracing::debug!(
                "Retrying {} after {} (try {})",
                task.url,
                reason,
                task.network_try_count
            );
            task.restore_request(result.request_snapshot);
            task.refresh_cache = true;
            task.delay = None;
            for extension in &self.ctx.extensions {
                extension.on_retry(&task, &reason);
            }
            self.ctx.stats.inc("network-retry");
            self.ctx.route_task(task).await
        } else {
            tracing::warn!(
                "Dropping {} after {} network tries (last: {})",
                task.url,
                task.network_try_count,
                reason
            );
            self.ctx.stats.inc("task-dropped");
            Ok(())
        }
    }

    async fn retry_integrity(&self, task: Task, reason: &str) -> Result<(), FlowError> {
        tracing::warn!("Content of {} not valid ({}), trying again", task.url, reason);
        self.ctx.stats.inc("integrity-error");

        // The cached copy is what failed validation; fetch a fresh one.
        // A delay only applies to the first scheduling.
        let mut retry = task.clone_for_retry();
        retry.refresh_cache = true;
        retry.delay = None;

        let (is_valid, reason) = self.ctx.check_task_limits(&retry);
        if !is_valid {
            self.handle_rejected(retry, reason);
            return Ok(());
        }

        for extension in &self.ctx.extensions {
            extension.on_retry(&retry, "integrity-error");
        }
        self.ctx.route_task(retry).await
    }

    async fn handle_data(&self, data: Data, origin: Option<&Task>) -> Result<(), FlowError> {
        match self.ctx.registry.call_data_handler(&data) {
            Ok(()) => {
                self.ctx.stats.inc(format!("data-{}", data.handler_name));
                Ok(())
            }
            Err(error) => self.handle_error(error, origin).await,
        }
    }

    async fn handle_error(&self, error: HandlerError, origin: Option<&Task>) -> Result<(), FlowError> {
        let handler_name = origin.map(|t| t.name.as_str()).unwrap_or("<none>");
        self.ctx.report_error(handler_name, &error);

        if error.is_fatal() {
            let fatal = FatalError::new(
                FatalKind::Handler,
                error.to_string(),
                format!("handler '{}'", handler_name),
            );
            self.escalate(fatal).await;
        }
        Ok(())
    }

    fn handle_rejected(&self, task: Task, reason: &'static str) {
        tracing::warn!("Task {} {} rejected: {}", task.name, task.url, reason);
        self.ctx.stats.inc(format!("task-rejected-{}", reason));
        self.ctx.stats.inc("task-dropped");

        if let Err(error) = self.ctx.registry.call_fallback(&task) {
            self.ctx.report_error(&task.name, &error);
        }
    }

    async fn escalate(&self, fatal: FatalError) {
        tracing::error!("Fatal: {}", fatal);
        if self.ctx.channels.fatal_tx.send(fatal).await.is_err() {
            tracing::error!("Fatal channel closed");
        }
    }
}

#[async_trait]
impl WorkerUnit for DispatcherUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        match self.ctx.channels.dispatch_rx.try_recv() {
            Ok(Some(dispatch)) => {
                self.handle(dispatch).await?;
                Ok(Step::Worked)
            }
            Ok(None) => Ok(Step::Idle),
            Err(_) => Ok(Step::Finished),
        }
    }
}

/// The single worker reconciling all service outputs
pub struct DispatcherService {
    pool: WorkerPool,
}

impl DispatcherService {
    pub fn new(ctx: Arc<CrawlContext>) -> Self {
        let idle_poll = ctx.config.pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();
        let factory: UnitFactory =
            Arc::new(move || Box::new(DispatcherUnit { ctx: ctx.clone() }) as Box<dyn WorkerUnit>);

        Self {
            pool: WorkerPool::new("dispatcher", 1, factory, fatal_tx, idle_poll),
        }
    }
}

impl Service for DispatcherService {
    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
