//! Integration tests for the pipeline
//!
//! Most tests drive the full crawler over a scripted transport so retries,
//! failures and timing are deterministic. The last one runs the default
//! reqwest transport against a wiremock server.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sumi_flow::cache::{CacheBackend, SqliteCache};
use sumi_flow::config::Config;
use sumi_flow::crawler::{parse_html, CrawlerBuilder, HandlerError, HandlerOutput};
use sumi_flow::queue::{MemoryTaskQueue, TaskQueue};
use sumi_flow::service::FatalKind;
use sumi_flow::task::{Data, Request, Task};
use sumi_flow::transport::{Response, Transport, TransportError, TransportErrorKind};
use sumi_flow::FlowError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Fast polling so runs finish quickly
fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.idle_poll_ms = 5;
    config.pipeline.network_threads = 4;
    config
}

fn tasks(name: &str, count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(name, format!("https://example.com/{}/{}", name, i)))
        .collect()
}

/// How the scripted transport answers one URL
#[derive(Clone)]
enum Script {
    /// Connection refused on every try
    Refused,
    /// `status` for the first `times` tries, then 200
    StatusThenOk { status: u16, times: usize },
    /// An error the transport cannot classify
    Unclassified,
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    latency: Option<Duration>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

impl ScriptedTransport {
    fn script(mut self, url: &str, script: Script) -> Self {
        self.scripts.insert(url.to_string(), script);
        self
    }

    fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight.lock().unwrap().contains(url)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        let url = request.url.clone();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if !self.in_flight.lock().unwrap().insert(url.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.lock().unwrap().remove(&url);

        match self.scripts.get(&url) {
            Some(Script::Refused) => Err(TransportError::network(
                TransportErrorKind::Connect,
                "connection refused",
            )),
            Some(Script::StatusThenOk { status, times }) if call <= *times => {
                Ok(Response::new(url, *status, "try again"))
            }
            Some(Script::Unclassified) => Err(TransportError::Other("tls engine exploded".into())),
            _ => Ok(Response::new(url.clone(), 200, format!("<title>{}</title>", url))),
        }
    }
}

#[tokio::test]
async fn test_five_tasks_run_to_completion() {
    let transport = Arc::new(ScriptedTransport::default());
    let queue = Arc::new(MemoryTaskQueue::new());
    let stored = Arc::new(Mutex::new(Vec::new()));
    let sink = stored.clone();

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport.clone())
        .task_queue(queue.clone())
        .handler("page", |_, task| {
            Ok(vec![Data::new("page").with("url", task.url.clone()).into()])
        })
        .data_handler("page", move |data| {
            sink.lock().unwrap().push(data.get("url").cloned());
            Ok(())
        })
        .initial_tasks(tasks("page", 5))
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();

    assert_eq!(stats.get("task-processed"), 5);
    assert_eq!(stats.get("task-page-ok"), 5);
    assert_eq!(stats.get("data-page"), 5);
    assert_eq!(stats.get("request-network"), 5);
    assert_eq!(stats.get("task-dropped"), 0);
    assert_eq!(stored.lock().unwrap().len(), 5);
    assert_eq!(transport.total_calls(), 5);
    assert_eq!(queue.size().unwrap(), 0);
}

#[tokio::test]
async fn test_follow_up_tasks_are_crawled() {
    let crawler = CrawlerBuilder::new(test_config())
        .transport(Arc::new(ScriptedTransport::default()))
        .handler("index", |_, _| {
            Ok(tasks("item", 3).into_iter().map(HandlerOutput::from).collect())
        })
        .handler("item", |_, _| Ok(Vec::new()))
        .initial_tasks(tasks("index", 1))
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-index-ok"), 1);
    assert_eq!(stats.get("task-item-ok"), 3);
    assert_eq!(stats.get("task-processed"), 4);
}

#[tokio::test]
async fn test_task_is_never_fetched_and_parsed_at_once() {
    let transport = Arc::new(ScriptedTransport::default().latency(Duration::from_millis(2)));
    let watched = transport.clone();
    let parsed = Arc::new(Mutex::new(HashSet::new()));
    let seen = parsed.clone();
    let violations = Arc::new(AtomicUsize::new(0));
    let counter = violations.clone();

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport.clone())
        .handler("page", move |_, task| {
            if watched.is_in_flight(&task.url) || !seen.lock().unwrap().insert(task.url.clone()) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Vec::new())
        })
        .initial_tasks(tasks("page", 50))
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-processed"), 50);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(transport.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(transport.total_calls(), 50);
    assert_eq!(parsed.lock().unwrap().len(), 50);
}

#[tokio::test]
async fn test_always_failing_fetch_is_dropped_after_limit() {
    let url = "https://example.com/down";
    let transport = Arc::new(ScriptedTransport::default().script(url, Script::Refused));
    let mut config = test_config();
    config.pipeline.network_try_limit = 3;
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();

    let crawler = CrawlerBuilder::new(config)
        .transport(transport.clone())
        .handler("page", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
        .initial_tasks(vec![Task::new("page", url)])
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(transport.calls(url), 3);
    assert_eq!(stats.get("network-error-connect"), 3);
    assert_eq!(stats.get("network-retry"), 2);
    assert_eq!(stats.get("task-dropped"), 1);
    assert_eq!(stats.get("task-processed"), 0);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bad_status_is_retried_until_valid() {
    let url = "https://example.com/flaky";
    let transport = Arc::new(
        ScriptedTransport::default().script(url, Script::StatusThenOk { status: 503, times: 2 }),
    );

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport.clone())
        .handler("page", |result, _| {
            assert_eq!(result.status(), Some(200));
            Ok(Vec::new())
        })
        .initial_tasks(vec![Task::new("page", url)])
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(transport.calls(url), 3);
    assert_eq!(stats.get("network-retry"), 2);
    assert_eq!(stats.get("task-processed"), 1);
}

#[tokio::test]
async fn test_cache_hit_skips_network() {
    let url = "https://example.com/cached";
    let cache = Arc::new(SqliteCache::in_memory().unwrap());
    cache
        .save(url, &Response::new(url, 200, "<title>from cache</title>"))
        .unwrap();
    let transport = Arc::new(ScriptedTransport::default());

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport.clone())
        .cache(cache.clone())
        .handler("page", |result, _| {
            assert!(result.from_cache);
            assert_eq!(result.response().unwrap().text(), "<title>from cache</title>");
            Ok(Vec::new())
        })
        .initial_tasks(vec![Task::new("page", url)])
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(transport.total_calls(), 0);
    assert_eq!(stats.get("cache-hit"), 1);
    assert_eq!(stats.get("cache-save"), 0);
    assert_eq!(stats.get("task-processed"), 1);
}

#[tokio::test]
async fn test_cache_miss_is_fetched_and_saved() {
    let cache = Arc::new(SqliteCache::in_memory().unwrap());
    let transport = Arc::new(ScriptedTransport::default());
    let mut posted = Task::new("page", "https://example.com/form");
    posted.request = Some(Request::post("https://example.com/form", "q=1"));

    let mut initial = tasks("page", 3);
    initial.push(posted);

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport.clone())
        .cache(cache.clone())
        .handler("page", |_, _| Ok(Vec::new()))
        .initial_tasks(initial)
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(transport.total_calls(), 4);
    assert_eq!(stats.get("cache-miss"), 3);
    assert_eq!(stats.get("cache-save"), 3);
    assert_eq!(stats.get("task-processed"), 4);
    // POST responses are not cacheable
    assert_eq!(cache.size().unwrap(), 3);
    assert!(cache.get("https://example.com/form").unwrap().is_none());
}

/// A pipeline whose handler rejects every page as invalid content
fn always_invalid(
    transport: Arc<ScriptedTransport>,
    cache: Option<Arc<SqliteCache>>,
    handled: Arc<Mutex<Vec<bool>>>,
    fallen_back: Arc<Mutex<Vec<u32>>>,
) -> CrawlerBuilder {
    let mut config = test_config();
    config.pipeline.task_try_limit = 3;

    let mut builder = CrawlerBuilder::new(config)
        .transport(transport)
        .handler("page", move |result, _| {
            handled.lock().unwrap().push(result.from_cache);
            Err(HandlerError::ResponseNotValid("captcha page".to_string()))
        })
        .fallback("page", move |task| {
            fallen_back.lock().unwrap().push(task.task_try_count);
        })
        .initial_tasks(vec![Task::new("page", "https://example.com/guarded")]);
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder
}

#[tokio::test]
async fn test_invalid_content_is_retried_until_task_limit() {
    let transport = Arc::new(ScriptedTransport::default());
    let handled = Arc::new(Mutex::new(Vec::new()));
    let fallen_back = Arc::new(Mutex::new(Vec::new()));

    let crawler = always_invalid(transport.clone(), None, handled.clone(), fallen_back.clone())
        .build()
        .unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(transport.calls("https://example.com/guarded"), 3);
    assert_eq!(*handled.lock().unwrap(), vec![false, false, false]);
    assert_eq!(stats.get("integrity-error"), 3);
    assert_eq!(stats.get("task-rejected-task-try-count"), 1);
    assert_eq!(stats.get("task-dropped"), 1);
    assert_eq!(stats.get("task-processed"), 0);
    assert_eq!(*fallen_back.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_invalid_cached_content_is_refetched() {
    let url = "https://example.com/guarded";
    let cache = Arc::new(SqliteCache::in_memory().unwrap());
    cache
        .save(url, &Response::new(url, 200, "<title>stale captcha</title>"))
        .unwrap();
    let transport = Arc::new(ScriptedTransport::default());
    let handled = Arc::new(Mutex::new(Vec::new()));
    let fallen_back = Arc::new(Mutex::new(Vec::new()));

    let crawler = always_invalid(
        transport.clone(),
        Some(cache.clone()),
        handled.clone(),
        fallen_back.clone(),
    )
    .build()
    .unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run())
        .await
        .expect("run did not finish")
        .unwrap();

    // Only the first try is served from the cache; the retries go to the network
    assert_eq!(*handled.lock().unwrap(), vec![true, false, false]);
    assert_eq!(stats.get("cache-hit"), 1);
    assert_eq!(transport.calls(url), 2);
    assert_eq!(stats.get("integrity-error"), 3);
    assert_eq!(stats.get("task-rejected-task-try-count"), 1);
    assert_eq!(*fallen_back.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_handler_errors_do_not_stop_the_run() {
    let crawler = CrawlerBuilder::new(test_config())
        .transport(Arc::new(ScriptedTransport::default()))
        .handler("good", |_, _| Ok(Vec::new()))
        .handler("bad", |_, task| Err(HandlerError::Failed(format!("cannot parse {}", task.url))))
        .handler("panicky", |_, _| panic!("selector blew up"))
        .initial_tasks(
            tasks("good", 3)
                .into_iter()
                .chain(tasks("bad", 2))
                .chain(tasks("panicky", 1))
                .chain(tasks("unregistered", 1)),
        )
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-processed"), 3);
    assert_eq!(stats.get("error-failed"), 2);
    assert_eq!(stats.get("error-panicked"), 1);
    assert_eq!(stats.get("error-no-handler"), 1);
}

#[tokio::test]
async fn test_fatal_handler_error_stops_the_run() {
    let crawler = CrawlerBuilder::new(test_config())
        .transport(Arc::new(ScriptedTransport::default()))
        .handler("page", |_, _| Err(HandlerError::Fatal("quota exhausted".to_string())))
        .initial_tasks(tasks("page", 3))
        .build()
        .unwrap();

    match crawler.run().await {
        Err(FlowError::Fatal(fatal)) => {
            assert_eq!(fatal.kind, FatalKind::Handler);
            assert!(fatal.error.contains("quota exhausted"));
        }
        Err(other) => panic!("expected a fatal error, got {}", other),
        Ok(_) => panic!("expected a fatal error, run succeeded"),
    }
}

#[tokio::test]
async fn test_unclassified_transport_error_is_fatal() {
    let url = "https://example.com/broken";
    let transport = Arc::new(ScriptedTransport::default().script(url, Script::Unclassified));

    let crawler = CrawlerBuilder::new(test_config())
        .transport(transport)
        .handler("page", |_, _| Ok(Vec::new()))
        .initial_tasks(vec![Task::new("page", url)])
        .build()
        .unwrap();

    match crawler.run().await {
        Err(FlowError::Fatal(fatal)) => {
            assert_eq!(fatal.kind, FatalKind::WorkerError);
            assert!(fatal.context.starts_with("network"));
        }
        Err(other) => panic!("expected a fatal error, got {}", other),
        Ok(_) => panic!("expected a fatal error, run succeeded"),
    }
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let crawler = CrawlerBuilder::new(test_config())
        .transport(Arc::new(ScriptedTransport::default()))
        .handler("page", |_, _| Ok(Vec::new()))
        .build()
        .unwrap();

    crawler.run().await.unwrap();
    assert!(matches!(crawler.run().await, Err(FlowError::Misuse(_))));
}

#[tokio::test]
async fn test_generator_is_paced_by_queue_depth() {
    let config = test_config();
    let threshold = config.pipeline.task_queue_threshold();
    let queue = Arc::new(MemoryTaskQueue::new());
    let depth_queue = queue.clone();
    let deepest = Arc::new(AtomicUsize::new(0));
    let max_depth = deepest.clone();

    let crawler = CrawlerBuilder::new(config)
        .transport(Arc::new(ScriptedTransport::default()))
        .task_queue(queue.clone())
        .handler("page", move |_, _| {
            max_depth.fetch_max(depth_queue.size().unwrap_or(0), Ordering::SeqCst);
            Ok(Vec::new())
        })
        .task_generator(tasks("page", threshold * 3))
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-generated"), (threshold * 3) as u64);
    assert_eq!(stats.get("task-processed"), (threshold * 3) as u64);
    assert!(deepest.load(Ordering::SeqCst) <= threshold);
}

#[tokio::test]
async fn test_parser_workers_restart_after_budget() {
    let mut config = test_config();
    config.pipeline.parser_threads = 1;
    config.pipeline.parser_requests_per_process = 2;

    let crawler = CrawlerBuilder::new(config)
        .transport(Arc::new(ScriptedTransport::default()))
        .handler("page", |_, _| Ok(Vec::new()))
        .initial_tasks(tasks("page", 7))
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-processed"), 7);
}

#[tokio::test]
async fn test_pause_halts_progress_until_resume() {
    let crawler = CrawlerBuilder::new(test_config())
        .transport(Arc::new(
            ScriptedTransport::default().latency(Duration::from_millis(2)),
        ))
        .handler("page", |_, _| Ok(Vec::new()))
        .task_generator(tasks("page", 400))
        .build()
        .unwrap();

    let control = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        crawler.pause().await;
        assert!(!crawler.is_busy());

        let at_pause = crawler.stats().get("task-processed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(crawler.stats().get("task-processed"), at_pause);

        crawler.resume();
        at_pause
    };

    let (outcome, at_pause) = tokio::join!(crawler.run(), control);
    let stats = outcome.unwrap();
    assert!(at_pause < 400);
    assert_eq!(stats.get("task-processed"), 400);
}

#[tokio::test]
async fn test_crawl_over_http_with_default_transport() {
    let mock_server = MockServer::start().await;
    let base_url = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(
                    r#"<html><head><title>Home</title></head><body>
                    <a href="/page1">Page 1</a>
                    <a href="/page2">Page 2</a>
                    </body></html>"#,
                )
                .insert_header("content-type", "text/html"),
        )
        .mount(&mock_server)
        .await;

    for page in ["/page1", "/page2"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<html><head><title>{}</title></head></html>", page)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let titles = Arc::new(Mutex::new(Vec::new()));
    let sink = titles.clone();

    let crawler = CrawlerBuilder::new(test_config())
        .handler("index", |result, _| {
            let response = result
                .response()
                .ok_or_else(|| HandlerError::Failed("no response".to_string()))?;
            let base = url::Url::parse(&response.url).map_err(|e| HandlerError::Failed(e.to_string()))?;
            let page = parse_html(&response.text(), &base);
            Ok(page
                .links
                .into_iter()
                .map(|link| Task::new("page", link).into())
                .collect())
        })
        .handler("page", |result, _| {
            let response = result
                .response()
                .ok_or_else(|| HandlerError::Failed("no response".to_string()))?;
            let base = url::Url::parse(&response.url).map_err(|e| HandlerError::Failed(e.to_string()))?;
            let title = parse_html(&response.text(), &base).title.unwrap_or_default();
            Ok(vec![Data::new("title").with("title", title).into()])
        })
        .data_handler("title", move |data| {
            let title = data.get("title").and_then(|v| v.as_str()).unwrap_or_default();
            sink.lock().unwrap().push(title.to_string());
            Ok(())
        })
        .initial_tasks(vec![Task::new("index", format!("{}/", base_url))])
        .build()
        .unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.get("task-processed"), 3);

    let mut titles = titles.lock().unwrap().clone();
    titles.sort();
    assert_eq!(titles, vec!["/page1".to_string(), "/page2".to_string()]);
}
