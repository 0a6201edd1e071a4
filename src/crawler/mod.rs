//! Crawler module: wiring and running the pipeline
//!
//! This module contains:
//! - The handler registry and handler result types
//! - Extensions invoked at fixed pipeline points
//! - The shared crawl context and counters
//! - The crawler run loop (start, watch for fatal errors, detect completion,
//!   shut down)
//! - A small link/title extractor used by the command-line crawler

mod builder;
pub(crate) mod context;
mod extension;
mod handler;
mod links;
mod stats;

pub use builder::CrawlerBuilder;
pub use context::CrawlContext;
pub use extension::{DefaultHeaders, Extension};
pub use handler::{
    DataHandler, FallbackHandler, Handler, HandlerError, HandlerOutput, HandlerRegistry,
};
pub use links::{parse_html, ParsedPage};
pub use stats::{print_statistics, Stats, StatsSnapshot};

use crate::service::{
    CacheReaderService, CacheWriterService, DispatcherService, NetworkService, ParseService,
    Service, TaskGeneratorService,
};
use crate::task::Task;
use crate::{FlowError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Consecutive idle checks needed before the run is considered complete
const IDLE_CHECKS_TO_FINISH: u32 = 2;

/// A configured pipeline, ready to run once
pub struct Crawler {
    ctx: Arc<CrawlContext>,
    network: NetworkService,
    parser: ParseService,
    dispatcher: DispatcherService,
    cache_reader: Option<CacheReaderService>,
    cache_writer: Option<CacheWriterService>,
    generator: Option<TaskGeneratorService>,
    initial_tasks: Mutex<Vec<Task>>,
    started: AtomicBool,
}

impl Crawler {
    pub fn context(&self) -> &Arc<CrawlContext> {
        &self.ctx
    }

    fn services(&self) -> Vec<&dyn Service> {
        let mut services: Vec<&dyn Service> = Vec::new();
        if let Some(generator) = &self.generator {
            services.push(generator);
        }
        if let Some(reader) = &self.cache_reader {
            services.push(reader);
        }
        services.push(&self.network);
        services.push(&self.dispatcher);
        services.push(&self.parser);
        if let Some(writer) = &self.cache_writer {
            services.push(writer);
        }
        services
    }

    /// Runs the crawl to completion
    ///
    /// Returns the final counters, or `FlowError::Fatal` when a fatal error
    /// reached the fatal channel. A crawler can only run once.
    pub async fn run(&self) -> Result<StatsSnapshot> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FlowError::Misuse("crawler has already been run".to_string()));
        }

        let initial = std::mem::take(&mut *self.initial_tasks.lock().unwrap_or_else(|p| p.into_inner()));
        tracing::info!("Starting crawl with {} initial tasks", initial.len());
        for task in initial {
            self.ctx.route_task(task).await?;
        }

        for service in self.services() {
            service.start();
        }

        let outcome = self.watch().await;

        tracing::info!("Shutting down services");
        self.shutdown().await;

        if let Err(e) = self.ctx.task_queue.close() {
            tracing::warn!("Failed to close task queue: {}", e);
        }

        outcome?;
        let stats = self.ctx.stats.snapshot();
        tracing::info!(
            "Crawl finished: {} tasks processed in {:.2}s",
            stats.get("task-processed"),
            stats.elapsed.as_secs_f64()
        );
        Ok(stats)
    }

    /// Polls until a fatal error arrives or the pipeline drains
    async fn watch(&self) -> Result<()> {
        let idle_poll = self.ctx.config.pipeline.idle_poll();
        let mut idle_checks = 0;

        loop {
            if let Ok(Some(fatal)) = self.ctx.channels.fatal_rx.try_recv() {
                tracing::error!("Stopping crawl on fatal error: {}", fatal);
                return Err(FlowError::Fatal(fatal));
            }

            if self.is_drained()? {
                idle_checks += 1;
                if idle_checks >= IDLE_CHECKS_TO_FINISH {
                    return Ok(());
                }
            } else {
                idle_checks = 0;
            }

            tokio::time::sleep(idle_poll).await;
        }
    }

    /// Nothing queued, nothing in flight and no more tasks to generate
    fn is_drained(&self) -> Result<bool> {
        let generator_done = self
            .generator
            .as_ref()
            .map_or(true, TaskGeneratorService::is_finished);

        Ok(generator_done
            && self.ctx.task_queue.size()? == 0
            && self.ctx.channels.pending() == 0
            && !self.services().iter().any(|s| s.is_busy()))
    }

    async fn shutdown(&self) {
        for service in self.services() {
            service.stop();
        }
        for service in self.services() {
            service.join().await;
        }
    }

    /// Pauses every service; returns once all workers sit at their checkpoint
    pub async fn pause(&self) {
        tracing::info!("Pausing crawl");
        for service in self.services() {
            service.pause().await;
        }
    }

    pub fn resume(&self) {
        tracing::info!("Resuming crawl");
        for service in self.services() {
            service.resume();
        }
    }

    /// Aggregate busy flag over all services
    pub fn is_busy(&self) -> bool {
        self.services().iter().any(|s| s.is_busy())
    }

    /// Counters so far
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }
}
