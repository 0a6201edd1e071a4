//! Transport module: the HTTP fetch capability and fetch results
//!
//! The pipeline only depends on the `Transport` trait. `ReqwestTransport`
//! is the implementation used by the command-line crawler; tests plug in
//! their own.

mod http;

pub use http::{build_http_client, ReqwestTransport};

use crate::task::Request;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A fetched HTTP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Body decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Distinct failure classes a transport must report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Connect,
    ConnectTimeout,
    ReadTimeout,
    Protocol,
    TooManyRedirects,
}

impl TransportErrorKind {
    /// Stable short name used in counters and logs
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ConnectTimeout => "connect-timeout",
            Self::ReadTimeout => "read-timeout",
            Self::Protocol => "protocol",
            Self::TooManyRedirects => "too-many-redirects",
        }
    }

    /// Stable numeric code
    pub fn code(&self) -> u16 {
        match self {
            Self::Connect => 7,
            Self::ConnectTimeout => 28,
            Self::ReadTimeout => 29,
            Self::Protocol => 56,
            Self::TooManyRedirects => 47,
        }
    }
}

/// Errors produced by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// A recognized network failure; retried by the dispatcher
    #[error("{} error: {message}", .kind.abbreviation())]
    Network {
        kind: TransportErrorKind,
        message: String,
    },

    /// Anything the transport cannot classify; escalated as fatal
    #[error("unclassified transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn network(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }
}

/// Fetches a request. Timeouts and redirects are the transport's business.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Classified network failure stored in a `NetworkResult`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError {
    pub kind: TransportErrorKind,
    pub code: u16,
    pub message: String,
    pub abbreviation: &'static str,
}

impl NetworkError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            abbreviation: kind.abbreviation(),
        }
    }
}

/// Outcome of one fetch attempt (or a cache lookup standing in for one)
#[derive(Debug, Clone)]
pub struct NetworkResult {
    /// Exactly one of response / error
    pub outcome: Result<Response, NetworkError>,

    /// Request configuration as it was before the fetch
    pub request_snapshot: Request,

    /// Synthesized from a cache hit instead of a real fetch
    pub from_cache: bool,
}

impl NetworkResult {
    pub fn success(response: Response, request_snapshot: Request) -> Self {
        Self {
            outcome: Ok(response),
            request_snapshot,
            from_cache: false,
        }
    }

    pub fn failure(error: NetworkError, request_snapshot: Request) -> Self {
        Self {
            outcome: Err(error),
            request_snapshot,
            from_cache: false,
        }
    }

    pub fn cached(response: Response, request_snapshot: Request) -> Self {
        Self {
            outcome: Ok(response),
            request_snapshot,
            from_cache: true,
        }
    }

    pub fn ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn response(&self) -> Option<&Response> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&NetworkError> {
        self.outcome.as_ref().err()
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    pub fn error_abbreviation(&self) -> Option<&'static str> {
        self.error().map(|e| e.abbreviation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviations_are_distinct() {
        let kinds = [
            TransportErrorKind::Connect,
            TransportErrorKind::ConnectTimeout,
            TransportErrorKind::ReadTimeout,
            TransportErrorKind::Protocol,
            TransportErrorKind::TooManyRedirects,
        ];
        let mut names: Vec<_> = kinds.iter().map(|k| k.abbreviation()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
    }

    #[test]
    fn test_network_result_exactly_one_side() {
        let request = Request::get("https://example.com/");
        let ok = NetworkResult::success(Response::new("https://example.com/", 200, "hi"), request.clone());
        assert!(ok.ok());
        assert_eq!(ok.status(), Some(200));
        assert!(ok.error().is_none());

        let failed = NetworkResult::failure(
            NetworkError::new(TransportErrorKind::ReadTimeout, "timed out"),
            request,
        );
        assert!(!failed.ok());
        assert!(failed.response().is_none());
        assert_eq!(failed.error_abbreviation(), Some("read-timeout"));
        assert_eq!(failed.error().map(|e| e.code), Some(29));
    }

    #[test]
    fn test_response_headers_case_insensitive() {
        let response = Response::new("https://example.com/", 200, "<html></html>")
            .with_header("Content-Type", "text/html");
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(response.text(), "<html></html>");
    }
}
