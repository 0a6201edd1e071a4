//! reqwest-backed transport
//!
//! This module handles:
//! - Building the HTTP client from the `[http]` config section
//! - Translating `Request` specs into reqwest requests
//! - Classifying reqwest failures into transport error kinds

use crate::config::HttpConfig;
use crate::task::{Method, Request};
use crate::transport::{Response, Transport, TransportError, TransportErrorKind};
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use sumi_flow::config::HttpConfig;
/// use sumi_flow::transport::build_http_client;
///
/// let client = build_http_client(&HttpConfig::default()).unwrap();
/// ```
pub fn build_http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(Policy::limited(config.max_redirects))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Transport executing requests with a shared reqwest client
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        let client = build_http_client(config)
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

/// Maps a reqwest error onto the transport error kinds
///
/// | reqwest condition | Kind |
/// |-------------------|------|
/// | timeout while connecting | ConnectTimeout |
/// | timeout | ReadTimeout |
/// | connect | Connect |
/// | redirect | TooManyRedirects |
/// | request / body / decode | Protocol |
/// | anything else | Other (fatal) |
pub(crate) fn classify_error(e: &reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() && e.is_connect() {
        TransportErrorKind::ConnectTimeout
    } else if e.is_timeout() {
        TransportErrorKind::ReadTimeout
    } else if e.is_connect() {
        TransportErrorKind::Connect
    } else if e.is_redirect() {
        TransportErrorKind::TooManyRedirects
    } else if e.is_request() || e.is_body() || e.is_decode() {
        TransportErrorKind::Protocol
    } else {
        return TransportError::Other(e.to_string());
    };
    TransportError::network(kind, e.to_string())
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), request.url.as_str());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| classify_error(&e))?;

        Ok(Response {
            url,
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
