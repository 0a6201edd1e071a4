//! Configuration module for Sumi-Flow
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every section is optional; missing keys fall back to defaults.
//!
//! # Example
//!
//! ```no_run
//! use sumi_flow::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("flow.toml")).unwrap();
//! println!("Network workers: {}", config.pipeline.network_threads);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CacheConfig, Config, CrawlConfig, HttpConfig, PipelineConfig, QueueBackend, QueueConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
