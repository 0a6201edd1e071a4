//! Cache reader and writer services
//!
//! Both run a single worker so slow cache I/O never holds up the network
//! pool. Cache failures are logged and counted; they never stop the run.

use crate::cache::CacheBackend;
use crate::crawler::CrawlContext;
use crate::service::worker::{Step, UnitFactory, WorkerPool, WorkerUnit};
use crate::service::{Dispatch, Origin, Service};
use crate::transport::NetworkResult;
use crate::FlowError;
use async_trait::async_trait;
use std::sync::Arc;

struct CacheReaderUnit {
    ctx: Arc<CrawlContext>,
    backend: Arc<dyn CacheBackend>,
}

#[async_trait]
impl WorkerUnit for CacheReaderUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        let task = match self.ctx.channels.cache_read_rx.try_recv() {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(Step::Idle),
            Err(_) => return Ok(Step::Finished),
        };

        // Hits never reach the network workers, so the limits are checked here too
        let (is_valid, reason) = self.ctx.check_task_limits(&task);
        if !is_valid {
            tracing::debug!("Rejecting {} ({})", task.url, reason);
            self.ctx.dispatch(Dispatch::rejected(task, reason, Origin::Cache)).await?;
            return Ok(Step::Worked);
        }

        match self.backend.get(&task.url) {
            Ok(Some(item)) => {
                tracing::debug!("Cache hit for {}", task.url);
                self.ctx.stats.inc("cache-hit");
                let result = NetworkResult::cached(item.response, task.effective_request());
                self.ctx.dispatch(Dispatch::cached(result, task)).await?;
            }
            Ok(None) => {
                tracing::trace!("Cache miss for {}", task.url);
                self.ctx.stats.inc("cache-miss");
                self.ctx.enqueue(task)?;
            }
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed: {}", task.url, e);
                self.ctx.stats.inc("cache-error");
                self.ctx.enqueue(task)?;
            }
        }
        Ok(Step::Worked)
    }
}

struct CacheWriterUnit {
    ctx: Arc<CrawlContext>,
    backend: Arc<dyn CacheBackend>,
}

#[async_trait]
impl WorkerUnit for CacheWriterUnit {
    async fn step(&mut self) -> Result<Step, FlowError> {
        let (task, response) = match self.ctx.channels.cache_write_rx.try_recv() {
            Ok(Some(pair)) => pair,
            Ok(None) => return Ok(Step::Idle),
            Err(_) => return Ok(Step::Finished),
        };

        if !task.is_cacheable() || !self.ctx.is_valid_response_code(response.status, &task) {
            return Ok(Step::Worked);
        }

        match self.backend.save(&task.url, &response) {
            Ok(()) => self.ctx.stats.inc("cache-save"),
            Err(e) => {
                tracing::warn!("Failed to cache {}: {}", task.url, e);
                self.ctx.stats.inc("cache-error");
            }
        }
        Ok(Step::Worked)
    }
}

/// Serves cacheable tasks from the cache before they reach the network
pub struct CacheReaderService {
    pool: WorkerPool,
}

impl CacheReaderService {
    pub fn new(ctx: Arc<CrawlContext>, backend: Arc<dyn CacheBackend>) -> Self {
        let idle_poll = ctx.config.pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();
        let factory: UnitFactory = Arc::new(move || {
            Box::new(CacheReaderUnit {
                ctx: ctx.clone(),
                backend: backend.clone(),
            }) as Box<dyn WorkerUnit>
        });

        Self {
            pool: WorkerPool::new("cache-reader", 1, factory, fatal_tx, idle_poll),
        }
    }
}

impl Service for CacheReaderService {
    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// Stores successful network responses
pub struct CacheWriterService {
    pool: WorkerPool,
}

impl CacheWriterService {
    pub fn new(ctx: Arc<CrawlContext>, backend: Arc<dyn CacheBackend>) -> Self {
        let idle_poll = ctx.config.pipeline.idle_poll();
        let fatal_tx = ctx.channels.fatal_tx.clone();
        let factory: UnitFactory = Arc::new(move || {
            Box::new(CacheWriterUnit {
                ctx: ctx.clone(),
                backend: backend.clone(),
            }) as Box<dyn WorkerUnit>
        });

        Self {
            pool: WorkerPool::new("cache-writer", 1, factory, fatal_tx, idle_poll),
        }
    }
}

impl Service for CacheWriterService {
    fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;
    use crate::config::Config;
    use crate::crawler::context::test_support::context;
    use crate::crawler::HandlerRegistry;
    use crate::service::{DispatchItem, Origin};
    use crate::task::{Request, Task};
    use crate::transport::Response;

    fn backend() -> Arc<dyn CacheBackend> {
        Arc::new(SqliteCache::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_hit_bypasses_queue() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        let backend = backend();
        backend
            .save("https://example.com/", &Response::new("https://example.com/", 200, "cached"))
            .unwrap();
        ctx.channels
            .cache_read_tx
            .send(Task::new("page", "https://example.com/"))
            .await
            .unwrap();

        let mut reader = CacheReaderUnit {
            ctx: ctx.clone(),
            backend,
        };
        assert_eq!(reader.step().await.unwrap(), Step::Worked);

        assert_eq!(ctx.task_queue.size().unwrap(), 0);
        let dispatch = ctx.channels.dispatch_rx.try_recv().unwrap().unwrap();
        assert_eq!(dispatch.meta.map(|m| m.from), Some(Origin::Cache));
        match dispatch.item {
            DispatchItem::Network(result) => {
                assert!(result.from_cache);
                assert_eq!(result.response().map(|r| r.text()), Some("cached".to_string()));
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(ctx.stats.get("cache-hit"), 1);
    }

    #[tokio::test]
    async fn test_miss_goes_to_queue() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        ctx.channels
            .cache_read_tx
            .send(Task::new("page", "https://example.com/"))
            .await
            .unwrap();

        let mut reader = CacheReaderUnit {
            ctx: ctx.clone(),
            backend: backend(),
        };
        reader.step().await.unwrap();
        assert_eq!(reader.step().await.unwrap(), Step::Idle);

        assert_eq!(ctx.task_queue.size().unwrap(), 1);
        assert_eq!(ctx.channels.dispatch_rx.len(), 0);
        assert_eq!(ctx.stats.get("cache-miss"), 1);
    }

    #[tokio::test]
    async fn test_task_over_try_limit_is_not_served() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        let backend = backend();
        backend
            .save("https://example.com/", &Response::new("https://example.com/", 200, "cached"))
            .unwrap();
        let mut task = Task::new("page", "https://example.com/");
        task.task_try_count = ctx.config.pipeline.task_try_limit + 1;
        ctx.channels.cache_read_tx.send(task).await.unwrap();

        let mut reader = CacheReaderUnit {
            ctx: ctx.clone(),
            backend,
        };
        assert_eq!(reader.step().await.unwrap(), Step::Worked);

        let dispatch = ctx.channels.dispatch_rx.try_recv().unwrap().unwrap();
        assert_eq!(dispatch.meta.map(|m| m.from), Some(Origin::Cache));
        match dispatch.item {
            DispatchItem::Rejected { reason } => assert_eq!(reason, "task-try-count"),
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(ctx.stats.get("cache-hit"), 0);
        assert_eq!(ctx.task_queue.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_filters() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        let backend = backend();
        let mut writer = CacheWriterUnit {
            ctx: ctx.clone(),
            backend: backend.clone(),
        };

        let pairs = vec![
            (
                Task::new("page", "https://example.com/ok"),
                Response::new("https://example.com/ok", 200, "ok"),
            ),
            (
                Task::new("page", "https://example.com/err"),
                Response::new("https://example.com/err", 500, "err"),
            ),
            (
                Task::from_request("form", Request::post("https://example.com/post", "x")),
                Response::new("https://example.com/post", 200, "ok"),
            ),
            (
                Task::new("page", "https://example.com/off").disable_cache(),
                Response::new("https://example.com/off", 200, "ok"),
            ),
        ];
        for pair in pairs {
            ctx.channels.cache_write_tx.send(pair).await.unwrap();
            writer.step().await.unwrap();
        }

        assert_eq!(backend.size().unwrap(), 1);
        assert!(backend.get("https://example.com/ok").unwrap().is_some());
        assert_eq!(ctx.stats.get("cache-save"), 1);
    }
}
