//! Crawler extensions
//!
//! An extension is a capability attached to the crawler at build time. The
//! pipeline calls its hooks at fixed points: before a request is sent, after
//! a response (or cache hit) reaches the dispatcher, and when a task is
//! scheduled for another try. Hooks run inline, so they should be cheap.

use crate::task::{Request, Task};
use crate::transport::NetworkResult;

pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// May adjust the request about to be sent; the pre-fetch snapshot is
    /// already taken at this point
    fn before_request(&self, _task: &Task, _request: &mut Request) {}

    fn after_response(&self, _task: &Task, _result: &NetworkResult) {}

    fn on_retry(&self, _task: &Task, _reason: &str) {}
}

/// Adds a fixed set of headers to every request
#[derive(Debug, Clone, Default)]
pub struct DefaultHeaders {
    headers: Vec<(String, String)>,
}

impl DefaultHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Extension for DefaultHeaders {
    fn name(&self) -> &str {
        "default-headers"
    }

    fn before_request(&self, _task: &Task, request: &mut Request) {
        for (name, value) in &self.headers {
            request
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_do_not_override() {
        let extension = DefaultHeaders::new()
            .header("accept", "text/html")
            .header("x-crawl", "1");
        let task = Task::new("page", "https://example.com/");
        let mut request = Request::get("https://example.com/").with_header("accept", "*/*");

        extension.before_request(&task, &mut request);

        assert_eq!(request.headers.get("accept").map(String::as_str), Some("*/*"));
        assert_eq!(request.headers.get("x-crawl").map(String::as_str), Some("1"));
    }
}
