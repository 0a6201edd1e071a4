//! Sumi-Flow main entry point
//!
//! A small same-host crawler built on the pipeline: every seed becomes a
//! `page` task, every fetched page yields a `page` record and follow-up
//! tasks for its links until `crawl.max-depth` is reached.

use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sumi_flow::config::{load_config_with_hash, Config};
use sumi_flow::crawler::{
    parse_html, print_statistics, CrawlerBuilder, DefaultHeaders, HandlerError, HandlerOutput,
};
use sumi_flow::task::{Data, Task};
use sumi_flow::transport::NetworkResult;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Sumi-Flow: a concurrent crawl-task pipeline
#[derive(Parser, Debug)]
#[command(name = "sumi-flow")]
#[command(version)]
#[command(about = "Runs a crawl through the sumi-flow pipeline", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without crawling
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.dry_run {
        print_dry_run(&config);
        return Ok(());
    }

    handle_crawl(config).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_flow=info,warn"),
            1 => EnvFilter::new("sumi_flow=debug,info"),
            2 => EnvFilter::new("sumi_flow=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn print_dry_run(config: &Config) {
    println!("=== Sumi-Flow Dry Run ===\n");

    println!("Pipeline:");
    println!("  Network workers: {}", config.pipeline.network_threads);
    println!("  Parser workers: {}", config.pipeline.parser_threads);
    println!(
        "  Parser restart after: {} requests",
        config.pipeline.parser_requests_per_process
    );
    println!(
        "  Try limits: network {}, task {}",
        config.pipeline.network_try_limit, config.pipeline.task_try_limit
    );
    println!(
        "  Task queue threshold: {}",
        config.pipeline.task_queue_threshold()
    );

    println!("\nQueue:");
    println!("  Backend: {:?}", config.queue.backend);
    println!("  Name: {}", config.queue.name);

    println!("\nCache:");
    if config.cache.enabled {
        println!("  Enabled: {}", config.cache.path.as_deref().unwrap_or("-"));
    } else {
        println!("  Disabled");
    }

    println!("\nSeeds ({}), max depth {}:", config.crawl.seeds.len(), config.crawl.max_depth);
    for seed in &config.crawl.seeds {
        println!("  * {}", seed);
    }

    println!("\n✓ Configuration is valid");
}

async fn handle_crawl(config: Config) -> anyhow::Result<()> {
    if config.crawl.seeds.is_empty() {
        anyhow::bail!("no seeds configured under [crawl]");
    }

    let max_depth = config.crawl.max_depth;
    let seeds: Vec<Task> = config
        .crawl
        .seeds
        .iter()
        .map(|seed| Task::new("page", seed.as_str()).with_extra("depth", 0))
        .collect();
    let user_agent = config.http.user_agent.clone();
    let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(
        seeds.iter().map(|task| task.url.clone()).collect(),
    ));

    let crawler = CrawlerBuilder::new(config)
        .handler("page", move |result, task| {
            handle_page(result, task, max_depth, &seen)
        })
        .data_handler("page", |data| {
            tracing::info!(
                "{} [{}] {}",
                data.get("url").and_then(|v| v.as_str()).unwrap_or("-"),
                data.get("status").and_then(|v| v.as_u64()).unwrap_or(0),
                data.get("title").and_then(|v| v.as_str()).unwrap_or("")
            );
            Ok(())
        })
        .fallback("page", |task| {
            tracing::warn!("Giving up on {}", task.url);
        })
        .extension(DefaultHeaders::new().header("User-Agent", user_agent))
        .initial_tasks(seeds)
        .build()?;

    match crawler.run().await {
        Ok(stats) => {
            print_statistics(&stats);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            print_statistics(&crawler.stats());
            Err(e.into())
        }
    }
}

/// Emits the page record, then unseen same-host links one hop deeper
fn handle_page(
    result: &NetworkResult,
    task: &Task,
    max_depth: u32,
    seen: &Mutex<HashSet<String>>,
) -> Result<Vec<HandlerOutput>, HandlerError> {
    let response = result
        .response()
        .ok_or_else(|| HandlerError::Failed(format!("no response for {}", task.url)))?;
    let base = Url::parse(&response.url)
        .map_err(|e| HandlerError::Failed(format!("bad response url {}: {}", response.url, e)))?;

    let page = parse_html(&response.text(), &base);
    let depth = task.extra("depth").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    let mut outputs = vec![HandlerOutput::Data(
        Data::new("page")
            .with("url", response.url.clone())
            .with("status", response.status)
            .with("title", page.title.clone().unwrap_or_default())
            .with("links", page.links.len() as u64),
    )];

    if depth < max_depth {
        let mut seen = seen.lock().unwrap_or_else(|p| p.into_inner());
        for link in page.links {
            let same_host = Url::parse(&link)
                .map(|url| url.host_str() == base.host_str())
                .unwrap_or(false);
            if same_host && seen.insert(link.clone()) {
                outputs.push(Task::new("page", link).with_extra("depth", depth + 1).into());
            }
        }
    }

    Ok(outputs)
}
