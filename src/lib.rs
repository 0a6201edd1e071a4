//! Sumi-Flow: a concurrent crawl-task pipeline
//!
//! This crate schedules crawl tasks through a bounded set of network workers,
//! routes fetched results to parser workers running user handlers, and feeds
//! whatever the handlers produce back through a single dispatcher.
//!
//! # Example
//!
//! ```no_run
//! use sumi_flow::config::Config;
//! use sumi_flow::crawler::{CrawlerBuilder, HandlerOutput};
//! use sumi_flow::task::Task;
//!
//! # async fn run() -> sumi_flow::Result<()> {
//! let crawler = CrawlerBuilder::new(Config::default())
//!     .handler("page", |result, task| {
//!         tracing::info!("{} -> {:?}", task.url, result.status());
//!         Ok(Vec::<HandlerOutput>::new())
//!     })
//!     .initial_tasks(vec![Task::new("page", "https://example.com/")])
//!     .build()?;
//!
//! let stats = crawler.run().await?;
//! println!("processed: {}", stats.get("task-processed"));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod crawler;
pub mod queue;
pub mod service;
pub mod task;
pub mod transport;

use thiserror::Error;

/// Main error type for Sumi-Flow operations
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Handler error: {0}")]
    Handler(#[from] crawler::HandlerError),

    #[error("Fatal error: {0}")]
    Fatal(service::FatalError),

    #[error("Misuse: {0}")]
    Misuse(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Crawler, CrawlerBuilder};
pub use task::{Data, Request, Task};
