use crate::config::types::{
    CacheConfig, Config, CrawlConfig, HttpConfig, PipelineConfig, QueueBackend, QueueConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pipeline_config(&config.pipeline)?;
    validate_http_config(&config.http)?;
    validate_queue_config(&config.queue)?;
    validate_cache_config(&config.cache)?;
    validate_crawl_config(&config.crawl)?;
    Ok(())
}

/// Validates worker counts and retry budgets
fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.network_threads < 1 || config.network_threads > 1000 {
        return Err(ConfigError::Validation(format!(
            "network_threads must be between 1 and 1000, got {}",
            config.network_threads
        )));
    }

    if config.parser_threads < 1 || config.parser_threads > 1000 {
        return Err(ConfigError::Validation(format!(
            "parser_threads must be between 1 and 1000, got {}",
            config.parser_threads
        )));
    }

    if config.network_try_limit < 1 {
        return Err(ConfigError::Validation(format!(
            "network_try_limit must be >= 1, got {}",
            config.network_try_limit
        )));
    }

    if config.task_try_limit < 1 {
        return Err(ConfigError::Validation(format!(
            "task_try_limit must be >= 1, got {}",
            config.task_try_limit
        )));
    }

    if config.idle_poll_ms < 1 || config.idle_poll_ms > 10_000 {
        return Err(ConfigError::Validation(format!(
            "idle_poll_ms must be between 1 and 10000, got {}ms",
            config.idle_poll_ms
        )));
    }

    Ok(())
}

/// Validates HTTP transport configuration
fn validate_http_config(config: &HttpConfig) -> Result<(), ConfigError> {
    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout_secs must be >= 1".to_string(),
        ));
    }

    if let Some(code) = config
        .valid_status
        .iter()
        .find(|code| !(100..=599).contains(*code))
    {
        return Err(ConfigError::Validation(format!(
            "valid_status contains an invalid HTTP status code: {}",
            code
        )));
    }

    Ok(())
}

/// Validates that the chosen queue backend has what it needs
fn validate_queue_config(config: &QueueConfig) -> Result<(), ConfigError> {
    if config.name.is_empty() {
        return Err(ConfigError::Validation(
            "queue name cannot be empty".to_string(),
        ));
    }

    match config.backend {
        QueueBackend::Memory => {}
        QueueBackend::Sqlite => {
            if config.path.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Validation(
                    "sqlite queue backend requires a path".to_string(),
                ));
            }
            if !config
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConfigError::Validation(format!(
                    "sqlite queue name must contain only letters, digits and '_', got '{}'",
                    config.name
                )));
            }
        }
        QueueBackend::Redis => {
            let url = config.url.as_deref().unwrap_or("");
            let parsed = Url::parse(url)
                .map_err(|e| ConfigError::InvalidUrl(format!("Invalid redis url: {}", e)))?;
            if parsed.scheme() != "redis" && parsed.scheme() != "rediss" {
                return Err(ConfigError::InvalidUrl(format!(
                    "redis url must use the redis:// scheme, got '{}'",
                    url
                )));
            }
        }
    }

    Ok(())
}

fn validate_cache_config(config: &CacheConfig) -> Result<(), ConfigError> {
    if config.enabled && config.path.as_deref().map_or(true, str::is_empty) {
        return Err(ConfigError::Validation(
            "cache is enabled but no cache path is set".to_string(),
        ));
    }
    Ok(())
}

/// Validates seed URLs
fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    for seed in &config.seeds {
        let url = Url::parse(seed)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use the http or https scheme",
                seed
            )));
        }
    }

    Ok(())
}
