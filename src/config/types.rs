use serde::Deserialize;

/// Main configuration structure for Sumi-Flow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
}

/// Worker pool sizes and retry budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Number of network workers
    pub network_threads: usize,

    /// Number of parser workers
    pub parser_threads: usize,

    /// Results a parser worker handles before retiring (0 = unlimited)
    pub parser_requests_per_process: u64,

    /// Maximum fetch attempts for one task try
    pub network_try_limit: u32,

    /// Maximum number of task clones (content-integrity retries)
    pub task_try_limit: u32,

    /// How long an idle worker sleeps before polling its input again (milliseconds)
    pub idle_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            network_threads: 8,
            parser_threads: 2,
            parser_requests_per_process: 0,
            network_try_limit: 5,
            task_try_limit: 5,
            idle_poll_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Downstream depth at which the task generator stops injecting
    pub fn task_queue_threshold(&self) -> usize {
        std::cmp::max(200, self.network_threads * 2)
    }

    pub fn idle_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_poll_ms)
    }
}

/// HTTP transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpConfig {
    /// User agent sent with every request
    pub user_agent: String,

    /// Total request timeout in seconds
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum number of redirects followed per request
    pub max_redirects: usize,

    /// Extra status codes accepted as valid responses
    pub valid_status: Vec<u16>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sumi-flow/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            max_redirects: 10,
            valid_status: Vec::new(),
        }
    }
}

/// Which task queue backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

/// Task queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    pub backend: QueueBackend,

    /// SQLite database path (sqlite backend)
    pub path: Option<String>,

    /// Redis connection URL (redis backend)
    pub url: Option<String>,

    /// Key / table name of the queue
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            path: None,
            url: None,
            name: "task_queue".to_string(),
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// SQLite database path for cached responses
    pub path: Option<String>,
}

/// Seeds for the command-line crawler
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlConfig {
    /// Seed URLs, each becomes a `page` task
    pub seeds: Vec<String>,

    /// How many link hops to follow from a seed
    pub max_depth: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            max_depth: 1,
        }
    }
}
