//! Crawler construction
//!
//! Everything the pipeline needs is registered here, on the instance being
//! built: handlers, extensions, the queue backend, the transport, the cache
//! and the task sources. Anything left unset is derived from the config.

use crate::cache::{CacheBackend, SqliteCache};
use crate::config::{validate, Config};
use crate::crawler::context::CrawlContext;
use crate::crawler::extension::Extension;
use crate::crawler::handler::{HandlerError, HandlerOutput, HandlerRegistry};
use crate::crawler::stats::Stats;
use crate::crawler::Crawler;
use crate::queue::{open_queue, TaskQueue};
use crate::service::{
    CacheReaderService, CacheWriterService, Channels, DispatcherService, NetworkService,
    ParseService, TaskGeneratorService, TaskProducer,
};
use crate::task::{Data, Task};
use crate::transport::{NetworkResult, ReqwestTransport, Transport};
use crate::{ConfigError, FlowError, Result};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Builder for a `Crawler`
pub struct CrawlerBuilder {
    config: Config,
    registry: HandlerRegistry,
    extensions: Vec<Arc<dyn Extension>>,
    task_queue: Option<Arc<dyn TaskQueue>>,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn CacheBackend>>,
    producer: Option<TaskProducer>,
    initial_tasks: Vec<Task>,
}

impl CrawlerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            extensions: Vec::new(),
            task_queue: None,
            transport: None,
            cache: None,
            producer: None,
            initial_tasks: Vec::new(),
        }
    }

    /// Registers the handler for tasks named `name`
    pub fn handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&NetworkResult, &Task) -> std::result::Result<Vec<HandlerOutput>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register_handler(name, handler);
        self
    }

    /// Registers the handler for data items named `name`
    pub fn data_handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Data) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.register_data_handler(name, handler);
        self
    }

    /// Registers what runs when a task named `name` is rejected by its try limits
    pub fn fallback<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.registry.register_fallback(name, handler);
        self
    }

    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enables the cache services over `cache`
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Lazy task source, paced by downstream depth
    pub fn task_generator<I>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
        I::IntoIter: Send + 'static,
    {
        self.producer = Some(Box::new(tasks.into_iter()));
        self
    }

    /// Tasks routed before the services start
    pub fn initial_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.initial_tasks.extend(tasks);
        self
    }

    /// Validates the config and assembles the services
    ///
    /// A task queue, transport or cache that was not set explicitly is
    /// opened from the configuration.
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - A crawler ready to `run`
    /// * `Err(FlowError)` - Invalid configuration or a backend failed to open
    pub fn build(self) -> Result<Crawler> {
        validate(&self.config)?;

        if self.registry.handler_names().is_empty() {
            tracing::warn!("No handlers registered; every fetched task will fail with no-handler");
        }

        let task_queue = match self.task_queue {
            Some(queue) => queue,
            None => open_queue(&self.config.queue)?,
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config.http)?),
        };

        let cache: Option<Arc<dyn CacheBackend>> = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.cache.enabled => {
                let path = self.config.cache.path.as_deref().ok_or_else(|| {
                    FlowError::Config(ConfigError::Validation(
                        "cache.path is required when the cache is enabled".to_string(),
                    ))
                })?;
                Some(Arc::new(SqliteCache::open(Path::new(path))?))
            }
            None => None,
        };

        let ctx = Arc::new(CrawlContext {
            config: Arc::new(self.config),
            task_queue,
            registry: Arc::new(self.registry),
            extensions: self.extensions,
            stats: Arc::new(Stats::new()),
            channels: Channels::new(),
            cache: cache.clone(),
        });

        let (cache_reader, cache_writer) = match cache {
            Some(backend) => (
                Some(CacheReaderService::new(ctx.clone(), backend.clone())),
                Some(CacheWriterService::new(ctx.clone(), backend)),
            ),
            None => (None, None),
        };

        Ok(Crawler {
            network: NetworkService::new(ctx.clone(), transport),
            parser: ParseService::new(ctx.clone()),
            dispatcher: DispatcherService::new(ctx.clone()),
            generator: self
                .producer
                .map(|producer| TaskGeneratorService::new(ctx.clone(), producer)),
            cache_reader,
            cache_writer,
            ctx,
            initial_tasks: Mutex::new(self.initial_tasks),
            started: AtomicBool::new(false),
        })
    }
}
