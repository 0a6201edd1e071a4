//! State shared by every service of one crawl
//!
//! The context owns the routing decisions the services must agree on:
//! where a new task goes, whether a task is still within its try limits,
//! which status codes count as valid, and how errors are reported.

use crate::cache::CacheBackend;
use crate::config::Config;
use crate::crawler::extension::Extension;
use crate::crawler::handler::{HandlerError, HandlerRegistry};
use crate::crawler::stats::Stats;
use crate::queue::TaskQueue;
use crate::service::{Channels, Dispatch};
use crate::task::Task;
use crate::{FlowError, Result};
use chrono::Utc;
use std::sync::Arc;

/// Shared crawl state handed to every service
pub struct CrawlContext {
    pub config: Arc<Config>,
    pub task_queue: Arc<dyn TaskQueue>,
    pub registry: Arc<HandlerRegistry>,
    pub extensions: Vec<Arc<dyn Extension>>,
    pub stats: Arc<Stats>,
    pub channels: Channels,
    /// Present when the cache services run
    pub cache: Option<Arc<dyn CacheBackend>>,
}

impl CrawlContext {
    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Sends a new or retried task to the cache reader or the task queue
    ///
    /// Cacheable tasks go through the cache reader unless they ask for a
    /// fresh copy; everything else is queued directly.
    pub async fn route_task(&self, task: Task) -> Result<()> {
        if self.cache_enabled() && task.is_cacheable() && !task.refresh_cache {
            self.channels
                .cache_read_tx
                .send(task)
                .await
                .map_err(|_| FlowError::ChannelClosed("cache reader".to_string()))?;
            return Ok(());
        }
        self.enqueue(task)
    }

    /// Puts a task into the task queue, honouring its delay
    ///
    /// The delay holds back the first scheduling only; the dispatcher clears
    /// it before a retried task comes back here.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let schedule_time = match task.delay {
            Some(delay) if !delay.is_zero() => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| FlowError::Misuse(format!("task delay out of range: {}", e)))?;
                Some(Utc::now() + delay)
            }
            _ => None,
        };

        tracing::trace!("Queueing {} {} (priority {})", task.name, task.url, task.priority);
        let priority = task.priority;
        self.task_queue.put(task, priority, schedule_time)?;
        Ok(())
    }

    /// Hands an item to the dispatcher
    pub async fn dispatch(&self, dispatch: Dispatch) -> Result<()> {
        self.channels
            .dispatch_tx
            .send(dispatch)
            .await
            .map_err(|_| FlowError::ChannelClosed("dispatcher".to_string()))
    }

    /// Checks the try limits of a task about to be fetched or served from cache
    ///
    /// # Arguments
    ///
    /// * `task` - The task, with its current try counters
    ///
    /// # Returns
    ///
    /// * `(true, "ok")` - Both counters are within their limits
    /// * `(false, reason)` - `"task-try-count"` or `"network-try-count"`
    pub fn check_task_limits(&self, task: &Task) -> (bool, &'static str) {
        let pipeline = &self.config.pipeline;
        if task.task_try_count > pipeline.task_try_limit {
            (false, "task-try-count")
        } else if task.network_try_count > pipeline.network_try_limit {
            (false, "network-try-count")
        } else {
            (true, "ok")
        }
    }

    /// Status codes the crawler accepts: anything below 400, 404, the
    /// configured extras, and the task's own extras
    pub fn is_valid_response_code(&self, code: u16, task: &Task) -> bool {
        code < 400
            || code == 404
            || self.config.http.valid_status.contains(&code)
            || task.valid_status.contains(&code)
    }

    /// Logs and counts an error raised for a handler
    pub fn report_error(&self, handler_name: &str, error: &HandlerError) {
        tracing::error!("Error in handler '{}': {}", handler_name, error);
        self.stats.inc(format!("error-{}", error.kind()));
    }

    /// Tasks queued or waiting in front of the network and parser
    pub fn downstream_depth(&self) -> Result<usize> {
        Ok(self.task_queue.size()?
            + self.channels.cache_read_rx.len()
            + self.channels.parse_rx.len())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::cache::SqliteCache;
    use crate::queue::QueueError;
    use std::time::Duration;

    #[test]
    fn test_limits() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        let limit = ctx.config.pipeline.network_try_limit;

        let mut task = Task::new("page", "https://example.com/");
        task.network_try_count = limit;
        assert_eq!(ctx.check_task_limits(&task), (true, "ok"));

        task.network_try_count = limit + 1;
        assert_eq!(ctx.check_task_limits(&task), (false, "network-try-count"));

        task.network_try_count = 1;
        task.task_try_count = ctx.config.pipeline.task_try_limit + 1;
        assert_eq!(ctx.check_task_limits(&task), (false, "task-try-count"));
    }

    #[test]
    fn test_valid_response_codes() {
        let mut config = Config::default();
        config.http.valid_status = vec![410];
        let ctx = context(config, HandlerRegistry::new());
        let task = Task::new("page", "https://example.com/").with_valid_status([503]);

        assert!(ctx.is_valid_response_code(200, &task));
        assert!(ctx.is_valid_response_code(302, &task));
        assert!(ctx.is_valid_response_code(404, &task));
        assert!(ctx.is_valid_response_code(410, &task));
        assert!(ctx.is_valid_response_code(503, &task));
        assert!(!ctx.is_valid_response_code(500, &task));
        assert!(!ctx.is_valid_response_code(403, &Task::new("page", "https://example.com/")));
    }

    #[tokio::test]
    async fn test_route_without_cache_goes_to_queue() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        ctx.route_task(Task::new("page", "https://example.com/")).await.unwrap();

        assert_eq!(ctx.task_queue.size().unwrap(), 1);
        assert_eq!(ctx.channels.cache_read_rx.len(), 0);
    }

    #[tokio::test]
    async fn test_route_with_cache() {
        let base = context(Config::default(), HandlerRegistry::new());
        let ctx = CrawlContext {
            config: base.config.clone(),
            task_queue: base.task_queue.clone(),
            registry: base.registry.clone(),
            extensions: Vec::new(),
            stats: base.stats.clone(),
            channels: Channels::new(),
            cache: Some(Arc::new(SqliteCache::in_memory().unwrap())),
        };

        ctx.route_task(Task::new("page", "https://example.com/a")).await.unwrap();
        ctx.route_task(Task::new("page", "https://example.com/b").refresh_cache())
            .await
            .unwrap();
        ctx.route_task(Task::new("page", "https://example.com/c").disable_cache())
            .await
            .unwrap();

        assert_eq!(ctx.channels.cache_read_rx.len(), 1);
        assert_eq!(ctx.task_queue.size().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delayed_task_is_scheduled() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        ctx.route_task(
            Task::new("page", "https://example.com/").with_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        assert_eq!(ctx.task_queue.size().unwrap(), 1);
        assert!(matches!(ctx.task_queue.get(), Err(QueueError::Empty)));
    }

    #[test]
    fn test_report_error_counts_kind() {
        let ctx = context(Config::default(), HandlerRegistry::new());
        ctx.report_error("page", &HandlerError::Failed("boom".into()));
        assert_eq!(ctx.stats.get("error-failed"), 1);
    }
}
