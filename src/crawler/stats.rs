//! Crawl counters
//!
//! Counters are plain named integers. Most are written by the dispatcher;
//! the network and cache services bump their own fetch counters.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Live counters shared by the services
#[derive(Debug)]
pub struct Stats {
    counters: Mutex<BTreeMap<String, u64>>,
    started: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    pub fn inc(&self, key: impl AsRef<str>) {
        self.add(key, 1);
    }

    pub fn add(&self, key: impl AsRef<str>, amount: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry(key.as_ref().to_string()).or_insert(0) += amount;
    }

    pub fn get(&self, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        StatsSnapshot {
            counters: counters.clone(),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Counters frozen at the end of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Value of a counter; counters never touched read as zero
    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Sum of every counter starting with `prefix`
    pub fn sum_prefix(&self, prefix: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, value)| value)
            .sum()
    }
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &StatsSnapshot) {
    println!("=== Crawl Statistics ===\n");

    println!("Overview:");
    println!("  Tasks processed: {}", stats.get("task-processed"));
    println!("  Network requests: {}", stats.get("request-network"));
    println!("  Cache hits: {}", stats.get("cache-hit"));
    println!("  Tasks dropped: {}", stats.get("task-dropped"));
    println!("  Elapsed: {:.2}s", stats.elapsed.as_secs_f64());

    let secs = stats.elapsed.as_secs_f64();
    if secs > 0.0 {
        println!(
            "  Rate: {:.2} tasks/sec",
            stats.get("task-processed") as f64 / secs
        );
    }
    println!();

    let errors: Vec<_> = stats
        .counters
        .iter()
        .filter(|(key, _)| key.starts_with("network-error-") || key.starts_with("error-"))
        .collect();
    if !errors.is_empty() {
        println!("Errors:");
        // Sort by count (descending)
        let mut errors = errors;
        errors.sort_by(|a, b| b.1.cmp(a.1));
        for (key, count) in errors {
            println!("  {}: {}", key, count);
        }
        println!();
    }

    println!("All Counters:");
    for (key, count) in &stats.counters {
        println!("  {}: {}", key, count);
    }
}
